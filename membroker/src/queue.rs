//! The FIFO request queue.

use std::collections::HashMap;
use std::time::Instant;

use crate::ids::{ClientId, RequestId};
use crate::solicitation::RequestKind;

/// An outstanding grant request from a sink or bidi client.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub requester: ClientId,
    pub kind: RequestKind,
    pub needed: i32,
    pub acquired: i32,
    pub in_flight_donor: Option<ClientId>,
    /// Donors that have already responded to a solicitation raised on this
    /// request's behalf, keyed by client, recording the kind they were
    /// asked under.
    pub polled: HashMap<ClientId, RequestKind>,
    pub complete: bool,
    pub created_at: Instant,
}

impl Request {
    /// Whether `candidate` may still be solicited on this request's behalf:
    /// not the requester itself, and not already polled under this
    /// request's current kind.
    pub fn is_open_candidate(&self, candidate: ClientId) -> bool {
        if candidate == self.requester {
            return false;
        }
        match self.polled.get(&candidate) {
            Some(polled_kind) => *polled_kind != self.kind,
            None => true,
        }
    }
}

/// The ordered FIFO queue of requests. Order is load-bearing (the matching
/// pass always considers requests oldest-first) so this stays a plain
/// insertion-ordered sequence rather than any kind of set or map.
#[derive(Debug, Default)]
pub struct RequestQueue {
    requests: Vec<Request>,
    next_id: u64,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_request_id(&mut self) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn push_back(&mut self, request: Request) {
        self.requests.push(request);
    }

    pub fn is_empty(&self) -> bool {
        self.requests.iter().all(|r| r.complete)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn get(&self, id: RequestId) -> Option<&Request> {
        self.requests.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        self.requests.iter_mut().find(|r| r.id == id)
    }

    /// Requests in FIFO order, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.requests.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Request> {
        self.requests.iter_mut()
    }

    pub fn find_by_requester(&self, requester: ClientId) -> Option<&Request> {
        self.requests.iter().find(|r| r.requester == requester)
    }

    /// Removes every completed request, returning them for the caller to
    /// act on (sending the SHARE reply and bookkeeping is not this type's
    /// responsibility).
    pub fn drain_completed(&mut self) -> Vec<Request> {
        let (completed, remaining): (Vec<_>, Vec<_>) =
            self.requests.drain(..).partition(|r| r.complete);
        self.requests = remaining;
        completed
    }

    /// Removes every request belonging to `client` (used when a client
    /// disconnects and its own active request must be cancelled), returning
    /// them so the caller can refund `acquired` pages.
    pub fn remove_by_requester(&mut self, client: ClientId) -> Vec<Request> {
        let (removed, remaining): (Vec<_>, Vec<_>) = self
            .requests
            .drain(..)
            .partition(|r| r.requester == client);
        self.requests = remaining;
        removed
    }

    /// Clears `client` out of every request's `in_flight_donor`/`polled`
    /// bookkeeping (used on disconnect, so a departed donor can't be left
    /// referenced).
    pub fn forget_donor(&mut self, client: ClientId) {
        for req in &mut self.requests {
            if req.in_flight_donor == Some(client) {
                req.in_flight_donor = None;
            }
            req.polled.remove(&client);
        }
    }
}
