//! The allocation engine: the heart of the broker. Drives the request queue
//! and per-client solicitation state to completion in response to inbound
//! messages, emitting outbound messages through an injected [`Outbound`]
//! sink so this module never has to know about real sockets.

use std::collections::HashMap;
use std::time::Instant;

use membroker_proto::{Message, Opcode};
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::ids::{ClientId, ConnId, RequestId};
use crate::queue::{Request, RequestQueue};
use crate::registry::{Client, Registry};
use crate::solicitation::{RequestKind, Solicitation};

/// Where the allocation engine sends outbound wire messages. The transport
/// layer implements this over real sockets; tests implement it over a
/// recording in-memory stand-in.
pub trait Outbound {
    /// Attempts to send `msg` to `to`. Returns `false` on failure (e.g. a
    /// broken pipe), which the engine treats as that donor having denied
    /// any solicitation currently outstanding against it (§4.4.4, §7).
    fn send(&mut self, to: ClientId, msg: Message) -> bool;
}

/// An [`Outbound`] that discards every message, always reporting success.
/// Used by tests (including other modules' doctests/unit tests, e.g.
/// [`crate::diagnostics`]) that only care about resulting broker state.
#[cfg(test)]
pub(crate) struct NullOutbound;

#[cfg(test)]
impl Outbound for NullOutbound {
    fn send(&mut self, _to: ClientId, _msg: Message) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct UpdateFlags {
    pages: bool,
    client_request: bool,
}

impl UpdateFlags {
    fn any(self) -> bool {
        self.pages || self.client_request
    }
}

/// The broker's allocation state: the client registry, the request queue,
/// and the owned page pool.
pub struct Broker {
    pub registry: Registry,
    pub queue: RequestQueue,
    pub server_pages: i32,
    pub total_donations_at_startup: i32,
    updates: UpdateFlags,
}

impl Broker {
    pub fn new(initial_pages: i32) -> Self {
        Self {
            registry: Registry::new(),
            queue: RequestQueue::new(),
            server_pages: initial_pages,
            total_donations_at_startup: 0,
            updates: UpdateFlags::default(),
        }
    }

    /// `server_pages + Σ donations of all connected sources`: the reply to
    /// `TOTAL`.
    pub fn total_pages(&self) -> i32 {
        (i64::from(self.server_pages) + self.registry.total_source_donations()) as i32
    }

    // ---- REGISTER -------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &mut self,
        conn: ConnId,
        id: ClientId,
        pid: Option<i32>,
        cmdline: Option<String>,
        bidi: bool,
        donation: i32,
        out: &mut impl Outbound,
    ) -> Result<(), BrokerError> {
        if self.registry.contains(id) {
            return Err(BrokerError::AlreadyRegistered(id));
        }
        let is_source = donation > 0;
        let client = Client {
            id,
            conn,
            pid,
            cmdline: cmdline.clone(),
            donation,
            balance: donation,
            bidi: bidi || is_source,
            active_request: None,
            solicitation: Solicitation::Idle,
        };
        self.registry.insert(client);
        info!(client = id.0, cmdline = cmdline.as_deref().unwrap_or("unknown"), "registered client");
        self.updates.client_request = true;
        self.run_fixpoint(out);
        Ok(())
    }

    // ---- REQUEST / RESERVE -----------------------------------------------

    pub fn request_or_reserve(
        &mut self,
        from: ClientId,
        kind: RequestKind,
        n: i32,
        out: &mut impl Outbound,
    ) -> Result<(), BrokerError> {
        if n < 0 {
            return Err(BrokerError::BadParam);
        }
        if !self.registry.contains(from) {
            return Err(BrokerError::UnknownClient(from));
        }
        // One queued request per client is enough; a second is dropped.
        if self.registry.get(from).unwrap().active_request.is_some() {
            debug!(client = from.0, "dropping request: already has one in flight");
            return Ok(());
        }

        // Fast path (§4.4.2): must be taken whenever possible so a later
        // request never jumps ahead of one already queued.
        if self.queue.is_empty() && self.server_pages >= n {
            self.server_pages -= n;
            self.registry.get_mut(from).unwrap().balance += n;
            out.send(from, Message::new(from.0, Opcode::Share, n));
            return Ok(());
        }

        let id = self.queue.next_request_id();
        self.queue.push_back(Request {
            id,
            requester: from,
            kind,
            needed: n,
            acquired: 0,
            in_flight_donor: None,
            polled: HashMap::new(),
            complete: false,
            created_at: Instant::now(),
        });
        self.registry.get_mut(from).unwrap().active_request = Some(id);
        self.updates.client_request = true;
        self.run_fixpoint(out);
        Ok(())
    }

    // ---- RETURN -----------------------------------------------------------

    pub fn handle_return(
        &mut self,
        from: ClientId,
        n: i32,
        out: &mut impl Outbound,
    ) -> Result<(), BrokerError> {
        if n < 0 {
            return Err(BrokerError::BadParam);
        }
        let client = self
            .registry
            .get_mut(from)
            .ok_or(BrokerError::UnknownClient(from))?;
        if client.balance < n {
            return Err(BrokerError::ContractViolation {
                client: from,
                reason: format!("returned {n} pages but holds only {}", client.balance),
            });
        }
        client.balance -= n;
        self.give_pages(n);
        self.run_fixpoint(out);
        Ok(())
    }

    // ---- SHARE / DENY from a donor ----------------------------------------

    pub fn handle_share_or_deny(
        &mut self,
        from: ClientId,
        pages: i32,
        out: &mut impl Outbound,
    ) -> Result<(), BrokerError> {
        let client = self
            .registry
            .get_mut(from)
            .ok_or(BrokerError::UnknownClient(from))?;
        if !client.bidi {
            return Err(BrokerError::ContractViolation {
                client: from,
                reason: "SHARE/DENY from a non-bidi client".to_owned(),
            });
        }
        client.balance -= pages;
        let kind = client.solicitation.kind();
        client.solicitation.reset();

        let mut remaining = pages;
        if let Some(kind) = kind {
            for req in self.queue.iter_mut() {
                if req.in_flight_donor != Some(from) {
                    continue;
                }
                let grant = remaining.min(req.needed);
                req.acquired += grant;
                req.needed -= grant;
                remaining -= grant;
                req.polled.insert(from, kind);
                req.in_flight_donor = None;
                if req.needed == 0 {
                    req.complete = true;
                }
            }
        }
        self.give_pages(remaining);
        self.updates.client_request = true;
        self.run_fixpoint(out);
        Ok(())
    }

    // ---- TERMINATE ----------------------------------------------------------

    pub fn terminate(&mut self, id: ClientId, out: &mut impl Outbound) -> Result<(), BrokerError> {
        if !self.registry.contains(id) {
            return Err(BrokerError::UnknownClient(id));
        }
        out.send(id, Message::new(id.0, Opcode::Terminate, 0));
        let balance = self.registry.get(id).map(|c| c.balance).unwrap_or(0);
        info!(client = id.0, balance, "client terminated, reclaiming pages");
        self.disconnect(id, out);
        Ok(())
    }

    /// Peer disconnect without a preceding TERMINATE: reclaims pages,
    /// cancels the departed client's own active request, and detaches it
    /// from every other request's donor bookkeeping.
    pub fn disconnect(&mut self, id: ClientId, out: &mut impl Outbound) {
        let Some(client) = self.registry.remove(id) else {
            return;
        };
        // Only the net the broker loaned this client is ours to reclaim;
        // its own donation was never the broker's pages to begin with.
        self.give_pages(client.balance - client.donation);
        for cancelled in self.queue.remove_by_requester(id) {
            self.give_pages(cancelled.acquired);
        }
        self.queue.forget_donor(id);
        self.updates.client_request = true;
        self.run_fixpoint(out);
    }

    // ---- QUERY / TOTAL / STATUS (no state mutation, no fixpoint) ----------

    pub fn query(&self, from: ClientId, out: &mut impl Outbound) -> Result<(), BrokerError> {
        if !self.registry.contains(from) {
            return Err(BrokerError::UnknownClient(from));
        }
        out.send(from, Message::new(from.0, Opcode::Query, self.server_pages));
        Ok(())
    }

    pub fn total(&self, from: ClientId, out: &mut impl Outbound) -> Result<(), BrokerError> {
        if !self.registry.contains(from) {
            return Err(BrokerError::UnknownClient(from));
        }
        out.send(from, Message::new(from.0, Opcode::Total, self.total_pages()));
        Ok(())
    }

    // ---- internal: bookkeeping helpers -------------------------------------

    /// Adds `pages` to the owned pool, setting the `PAGES` update flag only
    /// when the pool actually grew (mirrors the original's `give_server_pages`:
    /// a reclaim that nets out to a decrease doesn't trigger a fill pass).
    fn give_pages(&mut self, pages: i32) {
        self.server_pages += pages;
        if pages > 0 {
            self.updates.pages = true;
        }
    }

    // ---- the fixpoint loop (§4.4) -------------------------------------------

    fn run_fixpoint(&mut self, out: &mut impl Outbound) {
        if self.server_pages != 0 {
            self.updates.pages = true;
        }
        while self.updates.any() {
            let flags = self.updates;
            self.updates = UpdateFlags::default();
            if flags.pages {
                self.fill_queued_from_pool();
            }
            if flags.client_request {
                self.match_requests(out);
            }
            self.complete_requests(out);
        }
        self.return_surplus(out);
    }

    /// §4.4.2's pool-fill, applied to already-queued requests in FIFO order.
    fn fill_queued_from_pool(&mut self) {
        for req in self.queue.iter_mut() {
            if self.server_pages <= 0 {
                break;
            }
            if req.complete || req.needed <= 0 {
                continue;
            }
            let pages = self.server_pages.min(req.needed);
            req.acquired += pages;
            req.needed -= pages;
            self.server_pages -= pages;
            if req.needed == 0 {
                req.complete = true;
            }
        }
    }

    /// §4.4.3: the matching pass, followed by §4.4.4's dispatch of any
    /// solicitations it decided to raise.
    fn match_requests(&mut self, out: &mut impl Outbound) {
        let order = self.registry.ordered_ids();

        for req_id in self.request_ids_in_order() {
            let (requester, kind, needed, has_donor, is_complete) = {
                let req = self.queue.get(req_id).expect("request vanished mid-pass");
                (req.requester, req.kind, req.needed, req.in_flight_donor.is_some(), req.complete)
            };
            if is_complete || has_donor {
                continue;
            }
            if needed <= 0 {
                self.complete_one(req_id);
                continue;
            }

            let mut wait = false;
            for &candidate_id in &order {
                if !self.queue.get(req_id).unwrap().is_open_candidate(candidate_id) {
                    continue;
                }
                let Some(candidate) = self.registry.get(candidate_id) else {
                    continue;
                };
                if !candidate.bidi {
                    continue;
                }

                if let Some(active) = candidate.active_request {
                    // The candidate is itself a requester: a blocker, not a donor.
                    let candidate_kind = self.queue.get(active).map(|r| r.kind);
                    if candidate_kind == Some(RequestKind::Request) && kind == RequestKind::Reserve
                    {
                        wait = true;
                    }
                    continue;
                }

                if candidate.solicitation.is_outstanding() {
                    let candidate_kind = candidate.solicitation.kind().unwrap();
                    if candidate_kind == RequestKind::Request || kind == RequestKind::Reserve {
                        wait = true;
                    }
                    continue;
                }

                // Eligible: decide the effective kind, possibly downgrading
                // RESERVE to REQUEST on an unpolled source (try low-anxiety
                // first, escalate on a second sweep).
                let never_polled = !self.queue.get(req_id).unwrap().polled.contains_key(&candidate_id);
                let effective = if kind == RequestKind::Reserve && candidate.is_source() && never_polled
                {
                    RequestKind::Request
                } else {
                    kind
                };

                let candidate = self.registry.get_mut(candidate_id).unwrap();
                if candidate.solicitation.is_idle() {
                    candidate.solicitation = Solicitation::Pending { kind: effective, pages: 0 };
                }
                if candidate.solicitation.kind() == Some(effective) {
                    candidate.solicitation.accumulate(effective, needed);
                    let req = self.queue.get_mut(req_id).unwrap();
                    req.in_flight_donor = Some(candidate_id);
                    wait = true;
                    break;
                }
            }

            if !wait {
                self.complete_one(req_id);
            }
        }

        self.dispatch_solicitations(out);
    }

    fn request_ids_in_order(&self) -> Vec<RequestId> {
        self.queue.iter().map(|r| r.id).collect()
    }

    /// §4.4.4: walks the registry in canonical order, sending any `Pending`
    /// solicitation and transitioning it to `Outstanding`.
    fn dispatch_solicitations(&mut self, out: &mut impl Outbound) {
        for id in self.registry.ordered_ids() {
            let Some(client) = self.registry.get_mut(id) else {
                continue;
            };
            let Some((kind, pages)) = client.solicitation.dispatch() else {
                continue;
            };
            let msg = Message::new(id.0, kind.as_opcode(), pages);
            if out.send(id, msg) {
                debug!(donor = id.0, pages, kind = ?kind, "solicited donor");
            } else {
                warn!(donor = id.0, "send failed while soliciting donor, treating as denial");
                let mut any_detached = false;
                for req in self.queue.iter_mut() {
                    if req.in_flight_donor == Some(id) {
                        req.polled.insert(id, kind);
                        req.in_flight_donor = None;
                        any_detached = true;
                    }
                }
                if let Some(client) = self.registry.get_mut(id) {
                    client.solicitation.reset();
                }
                // The request(s) just detached from this donor have no
                // in_flight_donor anymore; re-run the matching pass so they
                // try another candidate instead of stalling.
                if any_detached {
                    self.updates.client_request = true;
                }
            }
        }
    }

    /// §4.4.5 completion policy, applied to one request by id.
    fn complete_one(&mut self, id: RequestId) {
        let req = self.queue.get_mut(id).expect("request vanished");
        if req.kind == RequestKind::Reserve && req.needed > 0 {
            let refund = req.acquired;
            req.acquired = 0;
            req.needed += refund;
            self.give_pages(refund);
        }
        let req = self.queue.get_mut(id).unwrap();
        req.complete = true;
        self.updates.client_request = true;
    }

    /// §4.4(c): sends SHARE for every newly-completed request, every
    /// fixpoint iteration.
    fn complete_requests(&mut self, out: &mut impl Outbound) {
        for req in self.queue.drain_completed() {
            let requester = req.requester;
            if let Some(client) = self.registry.get_mut(requester) {
                client.active_request = None;
                client.balance += req.acquired;
            }
            out.send(requester, Message::new(requester.0, Opcode::Share, req.acquired));
            info!(
                client = requester.0,
                acquired = req.acquired,
                needed = req.acquired + req.needed,
                "request completed"
            );
        }
    }

    /// §4.7: after the fixpoint settles, give any surplus back to donors
    /// we've borrowed from, if nothing is still waiting for it.
    fn return_surplus(&mut self, out: &mut impl Outbound) {
        if self.queue.len() != 0 || self.server_pages <= 0 {
            return;
        }
        for id in self.registry.ordered_ids() {
            if self.server_pages <= 0 {
                break;
            }
            let Some(client) = self.registry.get(id) else {
                continue;
            };
            if !client.is_source() || client.balance >= client.donation {
                continue;
            }
            let pages = self.server_pages.min(client.donation - client.balance);
            if out.send(id, Message::new(id.0, Opcode::Return, pages)) {
                self.server_pages -= pages;
                self.registry.get_mut(id).unwrap().balance += pages;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    /// Records every message the engine sends, and can be told to fail
    /// sends to specific clients (simulating a broken pipe) to exercise
    /// §4.4.4/§7's donor-denial-on-send-failure path.
    #[derive(Default)]
    struct RecordingOutbound {
        sent: Vec<(ClientId, Message)>,
        fail_to: HashSet<ClientId>,
    }

    impl Outbound for RecordingOutbound {
        fn send(&mut self, to: ClientId, msg: Message) -> bool {
            if self.fail_to.contains(&to) {
                return false;
            }
            self.sent.push((to, msg));
            true
        }
    }

    impl RecordingOutbound {
        fn shares_to(&self, id: ClientId) -> Vec<i32> {
            self.sent
                .iter()
                .filter(|(to, m)| *to == id && m.opcode == Opcode::Share)
                .map(|(_, m)| m.param)
                .collect()
        }

        fn last_solicitation(&self, id: ClientId) -> Option<Message> {
            self.sent
                .iter()
                .rev()
                .find(|(to, m)| *to == id && matches!(m.opcode, Opcode::Request | Opcode::Reserve))
                .map(|(_, m)| *m)
        }
    }

    fn register_source(
        broker: &mut Broker,
        out: &mut impl Outbound,
        id: i32,
        conn: i32,
        donation: i32,
    ) {
        broker
            .register(ConnId(conn), ClientId(id), None, None, true, donation, out)
            .unwrap();
    }

    fn register_sink(broker: &mut Broker, out: &mut impl Outbound, id: i32, conn: i32) {
        broker
            .register(ConnId(conn), ClientId(id), None, None, false, 0, out)
            .unwrap();
    }

    /// Scenario 1 (§8): immediate grant from the pool, then a grant that
    /// mixes pool pages with a solicited donor.
    #[test]
    fn normal_request_mixes_pool_and_solicited_donor() {
        let mut broker = Broker::new(5);
        let mut out = RecordingOutbound::default();
        register_source(&mut broker, &mut out, 1, 1, 10);
        register_sink(&mut broker, &mut out, 2, 2);

        assert_eq!(broker.total_pages(), 15);
        assert_eq!(broker.server_pages, 5);

        broker
            .request_or_reserve(ClientId(2), RequestKind::Request, 4, &mut out)
            .unwrap();
        assert_eq!(out.shares_to(ClientId(2)), vec![4]);
        assert_eq!(broker.server_pages, 1);

        // Returns everything it was holding.
        broker.handle_return(ClientId(2), 4, &mut out).unwrap();
        assert_eq!(broker.registry.get(ClientId(2)).unwrap().balance, 0);
        assert_eq!(broker.server_pages, 5);

        broker
            .request_or_reserve(ClientId(2), RequestKind::Request, 8, &mut out)
            .unwrap();
        // 5 from the pool plus a REQUEST solicitation on the source for 3.
        let solicited = out.last_solicitation(ClientId(1)).unwrap();
        assert_eq!(solicited.opcode, Opcode::Request);
        assert_eq!(solicited.param, 3);

        broker
            .handle_share_or_deny(ClientId(1), 3, &mut out)
            .unwrap();
        assert_eq!(out.shares_to(ClientId(2)), vec![4, 8]);
        assert_eq!(broker.server_pages, 0);
        assert_eq!(broker.registry.get(ClientId(1)).unwrap().balance, 7);
    }

    /// Scenario 2 (§8): a RESERVE that can never be fully assembled
    /// completes with SHARE(0); a donor that denies both sweeps ends up
    /// untouched and its pages are never removed from the pool.
    #[test]
    fn reserve_that_cannot_be_filled_refunds_to_zero() {
        let mut broker = Broker::new(5);
        let mut out = RecordingOutbound::default();
        register_source(&mut broker, &mut out, 1, 10, 10);
        register_sink(&mut broker, &mut out, 2, 20);

        broker
            .request_or_reserve(ClientId(2), RequestKind::Reserve, 15, &mut out)
            .unwrap();
        // First sweep solicits the source at the downgraded REQUEST kind.
        let first = out.last_solicitation(ClientId(1)).unwrap();
        assert_eq!(first.opcode, Opcode::Request);
        broker.handle_share_or_deny(ClientId(1), 0, &mut out).unwrap();

        // Second sweep escalates to RESERVE on the same (already-REQUEST-polled) source.
        let second = out.last_solicitation(ClientId(1)).unwrap();
        assert_eq!(second.opcode, Opcode::Reserve);
        broker.handle_share_or_deny(ClientId(1), 0, &mut out).unwrap();

        assert_eq!(out.shares_to(ClientId(2)), vec![0]);
        assert_eq!(broker.registry.get(ClientId(1)).unwrap().balance, 10);
        assert_eq!(broker.server_pages, 5);
    }

    /// A RESERVE that the donor partially fills, then denies the rest of,
    /// still fails all-or-nothing and refunds the partial amount back into
    /// the broker's own pool (§4.4.5) rather than to the donor directly.
    #[test]
    fn reserve_partial_fill_then_denial_refunds_into_the_pool() {
        let mut broker = Broker::new(0);
        let mut out = RecordingOutbound::default();
        register_source(&mut broker, &mut out, 1, 10, 10);
        register_sink(&mut broker, &mut out, 2, 20);

        broker
            .request_or_reserve(ClientId(2), RequestKind::Reserve, 6, &mut out)
            .unwrap();
        broker.handle_share_or_deny(ClientId(1), 4, &mut out).unwrap();
        assert_eq!(broker.registry.get(ClientId(1)).unwrap().balance, 6);
        // Second sweep (RESERVE) on the same donor is denied outright.
        broker.handle_share_or_deny(ClientId(1), 0, &mut out).unwrap();

        assert_eq!(out.shares_to(ClientId(2)), vec![0]);
        // The 4 pages the donor already shared land back in the pool, not
        // with the donor (whose balance reflects having lent them out).
        assert_eq!(broker.server_pages, 4);
        assert_eq!(broker.registry.get(ClientId(1)).unwrap().balance, 6);
    }

    /// §8 round-trip: disconnecting a requester cancels its own active
    /// request and refunds whatever it had already acquired back to the
    /// pool, rather than leaving those pages stranded.
    #[test]
    fn disconnect_of_requester_cancels_its_request_and_refunds_acquired_pages() {
        let mut broker = Broker::new(3);
        let mut out = RecordingOutbound::default();
        register_source(&mut broker, &mut out, 1, 1, 7);
        register_sink(&mut broker, &mut out, 2, 2);

        // Can't take the fast path (needs 10, pool only has 3); the pool
        // fill takes 3 and the rest is left soliciting the source, so the
        // request is still open (not complete) when we disconnect it.
        broker
            .request_or_reserve(ClientId(2), RequestKind::Reserve, 10, &mut out)
            .unwrap();
        assert_eq!(broker.server_pages, 0);
        assert!(!broker.queue.is_empty());

        broker.disconnect(ClientId(2), &mut out);
        assert!(broker.registry.get(ClientId(2)).is_none());
        assert_eq!(broker.server_pages, 3);
        assert!(broker.queue.is_empty());
    }

    /// §8 round-trip: disconnecting a donor mid-solicitation clears
    /// `in_flight_donor` on any request waiting on it and reclaims only the
    /// net the broker had loaned from it (never its own donation) into the
    /// pool.
    #[test]
    fn disconnect_of_donor_clears_in_flight_state_and_reclaims_its_balance() {
        let mut broker = Broker::new(0);
        let mut out = RecordingOutbound::default();
        register_source(&mut broker, &mut out, 1, 1, 10);
        register_sink(&mut broker, &mut out, 2, 2);

        broker
            .request_or_reserve(ClientId(2), RequestKind::Request, 5, &mut out)
            .unwrap();
        assert!(broker.queue.find_by_requester(ClientId(2)).unwrap().in_flight_donor.is_some());

        broker.disconnect(ClientId(1), &mut out);
        assert!(broker.registry.get(ClientId(1)).is_none());
        // The source had loaned nothing yet (balance == donation), so
        // disconnecting it reclaims none of its donation into the pool; the
        // request it was soliciting is detached from the now-gone donor and
        // simply waits, unfilled.
        assert!(out.shares_to(ClientId(2)).is_empty());
        assert_eq!(broker.server_pages, 0);
        let req = broker.queue.find_by_requester(ClientId(2)).unwrap();
        assert!(req.in_flight_donor.is_none());
        assert!(!broker.queue.is_empty());
    }

    /// Scenario 5 (§8): a send failure while soliciting one donor doesn't
    /// strand the request; the next fixpoint sweep routes to another donor.
    #[test]
    fn send_failure_during_solicitation_routes_to_next_donor() {
        let mut broker = Broker::new(0);
        let mut out = RecordingOutbound::default();
        register_source(&mut broker, &mut out, 1, 1, 10);
        register_source(&mut broker, &mut out, 2, 2, 10);
        register_sink(&mut broker, &mut out, 3, 3);

        out.fail_to.insert(ClientId(2));
        broker
            .request_or_reserve(ClientId(3), RequestKind::Request, 5, &mut out)
            .unwrap();

        // Source 2 is polled first (registered most recently, head of the
        // source-first list) but its send fails; source 1 should end up
        // soliciting instead, not a hang.
        assert!(
            out.last_solicitation(ClientId(1)).is_some(),
            "expected the request to fall through to the other source"
        );
        assert!(broker.registry.get(ClientId(2)).unwrap().solicitation.is_idle());
    }

    /// Negative page counts are rejected without mutating any state.
    #[test]
    fn negative_request_is_bad_param_and_does_not_touch_state() {
        let mut broker = Broker::new(5);
        let mut out = RecordingOutbound::default();
        register_sink(&mut broker, &mut out, 1, 1);

        let err = broker
            .request_or_reserve(ClientId(1), RequestKind::Request, -1, &mut out)
            .unwrap_err();
        assert!(matches!(err, BrokerError::BadParam));
        assert_eq!(broker.server_pages, 5);
        assert!(out.sent.is_empty());
    }

    /// Over-returning more than a client ever held is a fatal contract
    /// violation, not a silently-clamped error.
    #[test]
    fn over_return_beyond_holdings_is_a_contract_violation() {
        let mut broker = Broker::new(5);
        let mut out = RecordingOutbound::default();
        register_sink(&mut broker, &mut out, 1, 1);

        let err = broker.handle_return(ClientId(1), 1, &mut out).unwrap_err();
        assert!(err.is_fatal());
    }

    /// REQUEST(0) and RETURN(0) are no-ops that succeed.
    #[test]
    fn zero_amount_request_and_return_are_noops() {
        let mut broker = Broker::new(5);
        let mut out = RecordingOutbound::default();
        register_sink(&mut broker, &mut out, 1, 1);

        broker
            .request_or_reserve(ClientId(1), RequestKind::Request, 0, &mut out)
            .unwrap();
        assert_eq!(out.shares_to(ClientId(1)), vec![0]);
        broker.handle_return(ClientId(1), 0, &mut out).unwrap();
        assert_eq!(broker.server_pages, 5);
    }

    /// Page conservation (§8): `server_pages + Σ(balance - donation) +
    /// Σ(acquired)` never changes across a sequence of operations that
    /// doesn't change the total pages in the system.
    #[test]
    fn page_conservation_holds_across_a_request_reserve_sequence() {
        let mut broker = Broker::new(20);
        let mut out = RecordingOutbound::default();
        register_source(&mut broker, &mut out, 1, 1, 10);
        register_source(&mut broker, &mut out, 2, 2, 10);
        register_sink(&mut broker, &mut out, 3, 3);
        register_sink(&mut broker, &mut out, 4, 4);

        let conserved = |b: &Broker| {
            let client_sum: i32 = b
                .registry
                .iter_ordered()
                .map(|c| c.balance - c.donation)
                .sum();
            let acquired_sum: i32 = b.queue.iter().map(|r| r.acquired).sum();
            b.server_pages + client_sum + acquired_sum
        };
        let before = conserved(&broker);

        broker
            .request_or_reserve(ClientId(3), RequestKind::Request, 25, &mut out)
            .unwrap();
        assert_eq!(conserved(&broker), before);
        broker
            .request_or_reserve(ClientId(4), RequestKind::Reserve, 5, &mut out)
            .unwrap();
        assert_eq!(conserved(&broker), before);
        broker.handle_share_or_deny(ClientId(1), 10, &mut out).unwrap();
        assert_eq!(conserved(&broker), before);
        broker.handle_share_or_deny(ClientId(2), 10, &mut out).unwrap();
        assert_eq!(conserved(&broker), before);
        broker.handle_return(ClientId(3), 3, &mut out).unwrap();
        assert_eq!(conserved(&broker), before);
    }
}
