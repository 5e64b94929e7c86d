//! Textual snapshot of broker state, emitted over the diagnostic side
//! channel on demand (§4.2, §6). Format is grounded on the original
//! `dump_status`: a `server pages`/`total pages` header, a `CLIENTS`
//! section, and a `QUEUE` section when non-empty.

use std::fmt::Write as _;

use crate::engine::Broker;
use crate::solicitation::{RequestKind, Solicitation};

fn kind_verb(kind: RequestKind) -> &'static str {
    match kind {
        RequestKind::Request => "Requesting",
        RequestKind::Reserve => "Reserving",
    }
}

/// Renders the full diagnostic snapshot as a single string, ready to be
/// written to the debug socket before closing it.
pub fn dump(broker: &Broker) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "membroker: STATUS server pages = {} of {};  total pages = {}",
        broker.server_pages,
        broker.total_donations_at_startup,
        broker.total_pages(),
    );

    let _ = writeln!(out, "membroker: CLIENTS");
    for client in broker.registry.iter_ordered() {
        let role = if client.is_source() {
            "source"
        } else if client.bidi {
            "bidi"
        } else {
            "sink"
        };
        let _ = writeln!(
            out,
            "membroker: ({})-\"{}\" - {}: {} of {} pages",
            client.id.0,
            client.cmdline.as_deref().unwrap_or("unknown"),
            role,
            client.balance,
            client.donation,
        );
        if let Some(active) = client.active_request {
            if let Some(req) = broker.queue.get(active) {
                let _ = writeln!(
                    out,
                    "membroker:     {} {} of {} pages",
                    kind_verb(req.kind),
                    req.needed,
                    req.needed + req.acquired,
                );
            }
        }
        match client.solicitation {
            Solicitation::Idle => {}
            Solicitation::Pending { kind, pages } | Solicitation::Outstanding { kind, pages } => {
                let _ = writeln!(
                    out,
                    "membroker:     {} to share {} pages",
                    kind_verb(kind),
                    pages,
                );
            }
        }
    }

    if broker.queue.len() > 0 {
        let _ = writeln!(out, "membroker: QUEUE");
        for req in broker.queue.iter() {
            let requester_name = broker
                .registry
                .get(req.requester)
                .and_then(|c| c.cmdline.as_deref())
                .unwrap_or("unknown");
            let _ = writeln!(
                out,
                "membroker: Client ({})-\"{}\" {} {} of {} pages since {:?}",
                req.requester.0,
                requester_name,
                kind_verb(req.kind),
                req.needed,
                req.needed + req.acquired,
                req.created_at,
            );
            if let Some(donor_id) = req.in_flight_donor {
                if let Some(donor) = broker.registry.get(donor_id) {
                    if let Some(kind) = donor.solicitation.kind() {
                        let _ = writeln!(
                            out,
                            "membroker:     Actively {} {} pages from client ({})-\"{}\"",
                            kind_verb(kind),
                            donor
                                .solicitation
                                .pages()
                                .unwrap_or(0),
                            donor_id.0,
                            donor.cmdline.as_deref().unwrap_or("unknown"),
                        );
                    }
                }
            }
            if !req.polled.is_empty() {
                let _ = writeln!(out, "membroker:     Responded Clients:");
                for (&donor_id, &kind) in &req.polled {
                    let name = broker
                        .registry
                        .get(donor_id)
                        .and_then(|c| c.cmdline.as_deref())
                        .unwrap_or("unknown");
                    let _ = writeln!(
                        out,
                        "membroker:         {} from ({})-\"{}\"",
                        kind_verb(kind),
                        donor_id.0,
                        name,
                    );
                }
            }
        }
    }

    out
}
