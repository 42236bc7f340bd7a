//! Registry of page clients a worker can take control of.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use color_eyre::{eyre::eyre, Result};

use crate::cache::Generation;

/// Opaque identifier for a connected page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

/// Connected pages and the generation that currently controls each one.
#[derive(Default)]
pub struct ClientRegistry {
  next_id: AtomicU64,
  controllers: Mutex<BTreeMap<ClientId, Option<Generation>>>,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a new page. It starts out uncontrolled.
  pub fn connect(&self) -> Result<ClientId> {
    let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
    self.lock()?.insert(id, None);
    Ok(id)
  }

  /// Forget a page (tab closed).
  #[cfg(test)]
  pub fn disconnect(&self, id: ClientId) -> Result<()> {
    self.lock()?.remove(&id);
    Ok(())
  }

  /// Generation controlling the given page, if any.
  #[cfg(test)]
  pub fn controller(&self, id: ClientId) -> Result<Option<Generation>> {
    Ok(self.lock()?.get(&id).cloned().flatten())
  }

  /// Take control of every connected page. Returns how many were claimed.
  pub fn claim(&self, generation: &Generation) -> Result<usize> {
    let mut controllers = self.lock()?;
    for controller in controllers.values_mut() {
      *controller = Some(generation.clone());
    }
    Ok(controllers.len())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<ClientId, Option<Generation>>>> {
    self
      .controllers
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_new_client_is_uncontrolled() {
    let clients = ClientRegistry::new();
    let id = clients.connect().unwrap();
    assert_eq!(clients.controller(id).unwrap(), None);
  }

  #[test]
  fn test_claim_takes_over_every_client() {
    let clients = ClientRegistry::new();
    let a = clients.connect().unwrap();
    let b = clients.connect().unwrap();
    clients.claim(&Generation::new("v1")).unwrap();

    let v2 = Generation::new("v2");
    assert_eq!(clients.claim(&v2).unwrap(), 2);
    assert_eq!(clients.controller(a).unwrap(), Some(v2.clone()));
    assert_eq!(clients.controller(b).unwrap(), Some(v2));
  }

  #[test]
  fn test_disconnected_client_is_not_claimed() {
    let clients = ClientRegistry::new();
    let a = clients.connect().unwrap();
    clients.connect().unwrap();
    clients.disconnect(a).unwrap();

    assert_eq!(clients.claim(&Generation::new("v1")).unwrap(), 1);
    assert_eq!(clients.controller(a).unwrap(), None);
  }
}
