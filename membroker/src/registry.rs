//! The client registry: an ordered list (sources first) with side-indexed
//! lookup by id and by connection.

use std::collections::HashMap;

use crate::ids::{ClientId, ConnId, RequestId};
use crate::solicitation::Solicitation;

/// A connected participant.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub conn: ConnId,
    pub pid: Option<i32>,
    pub cmdline: Option<String>,
    pub donation: i32,
    pub balance: i32,
    pub bidi: bool,
    pub active_request: Option<RequestId>,
    pub solicitation: Solicitation,
}

impl Client {
    /// A source iff it advertised a nonzero donation. Sources are always
    /// bidi (enforced at registration).
    pub fn is_source(&self) -> bool {
        self.donation > 0
    }

    pub fn is_sink(&self) -> bool {
        !self.bidi
    }
}

/// The registry's ordering and id/fd indices. The order vector is the
/// canonical "list of clients" of the specification: sources at the head,
/// everyone else at the tail, in registration order within each group.
#[derive(Debug, Default)]
pub struct Registry {
    order: Vec<ClientId>,
    by_id: HashMap<ClientId, Client>,
    by_conn: HashMap<ConnId, ClientId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.by_id.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.by_id.get_mut(&id)
    }

    pub fn get_by_conn(&self, conn: ConnId) -> Option<&Client> {
        self.by_conn.get(&conn).and_then(|id| self.by_id.get(id))
    }

    pub fn id_for_conn(&self, conn: ConnId) -> Option<ClientId> {
        self.by_conn.get(&conn).copied()
    }

    /// Inserts a newly-registered client, placing it at the head of the
    /// order if it is a source, the tail otherwise. Returns `false` (and
    /// inserts nothing) if `id` is already registered.
    pub fn insert(&mut self, client: Client) -> bool {
        if self.by_id.contains_key(&client.id) {
            return false;
        }
        self.by_conn.insert(client.conn, client.id);
        if client.is_source() {
            self.order.insert(0, client.id);
        } else {
            self.order.push(client.id);
        }
        self.by_id.insert(client.id, client);
        true
    }

    /// Removes a client entirely (TERMINATE or disconnect). Returns the
    /// removed record so the caller can reclaim its pages and cancel its
    /// request.
    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        let client = self.by_id.remove(&id)?;
        self.by_conn.remove(&client.conn);
        self.order.retain(|c| *c != id);
        Some(client)
    }

    /// Clients in canonical order: sources first, then everyone else, each
    /// group in registration order.
    pub fn iter_ordered(&self) -> impl Iterator<Item = &Client> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }

    pub fn ordered_ids(&self) -> Vec<ClientId> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Sum of `donation` across every currently-connected source.
    pub fn total_source_donations(&self) -> i64 {
        self.iter_ordered()
            .filter(|c| c.is_source())
            .map(|c| i64::from(c.donation))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: i32, conn: i32, donation: i32, bidi: bool) -> Client {
        Client {
            id: ClientId(id),
            conn: ConnId(conn),
            pid: None,
            cmdline: None,
            donation,
            balance: donation,
            bidi: bidi || donation > 0,
            active_request: None,
            solicitation: Solicitation::Idle,
        }
    }

    #[test]
    fn sources_are_ordered_before_sinks() {
        let mut r = Registry::new();
        r.insert(client(1, 1, 0, false)); // sink
        r.insert(client(2, 2, 10, true)); // source
        r.insert(client(3, 3, 0, false)); // sink

        let ids: Vec<_> = r.iter_ordered().map(|c| c.id.0).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn rejects_duplicate_id() {
        let mut r = Registry::new();
        assert!(r.insert(client(1, 1, 0, false)));
        assert!(!r.insert(client(1, 2, 0, false)));
    }

    #[test]
    fn remove_drops_from_all_indices() {
        let mut r = Registry::new();
        r.insert(client(1, 1, 5, true));
        assert!(r.remove(ClientId(1)).is_some());
        assert!(r.get(ClientId(1)).is_none());
        assert!(r.get_by_conn(ConnId(1)).is_none());
        assert_eq!(r.len(), 0);
    }

    #[test]
    fn total_source_donations_ignores_sinks() {
        let mut r = Registry::new();
        r.insert(client(1, 1, 10, true));
        r.insert(client(2, 2, 0, false));
        r.insert(client(3, 3, 5, true));
        assert_eq!(r.total_source_donations(), 15);
    }
}
