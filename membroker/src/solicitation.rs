//! Explicit tagged solicitation state, replacing a sign-encoded
//! `(share_type, needed_pages)` pair with one enum that can't represent an
//! invalid combination.

use membroker_proto::Opcode;

/// Which kind of grant a solicitation or a queued request represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Best-effort: the broker returns whatever it could assemble.
    Request,
    /// All-or-nothing: anything less than the full amount is refunded.
    Reserve,
}

impl RequestKind {
    pub const fn as_opcode(self) -> Opcode {
        match self {
            Self::Request => Opcode::Request,
            Self::Reserve => Opcode::Reserve,
        }
    }
}

/// A bidi client's current solicitation state.
///
/// `Idle` clients are available to be solicited. The matching pass moves an
/// `Idle` client to `Pending`, and may keep adding to a `Pending` solicitation's
/// `pages` as more requests are matched against it (demand accumulates before
/// anything is sent). The dispatch phase transitions `Pending` to
/// `Outstanding` atomically with emitting the solicitation message; an
/// `Outstanding` solicitation is cleared back to `Idle` only when the donor
/// replies (or disconnects, or the send itself fails).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Solicitation {
    Idle,
    Pending { kind: RequestKind, pages: i32 },
    Outstanding { kind: RequestKind, pages: i32 },
}

impl Solicitation {
    pub const fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }

    pub const fn is_outstanding(self) -> bool {
        matches!(self, Self::Outstanding { .. })
    }

    pub const fn kind(self) -> Option<RequestKind> {
        match self {
            Self::Idle => None,
            Self::Pending { kind, .. } | Self::Outstanding { kind, .. } => Some(kind),
        }
    }

    /// The page count currently being accumulated or solicited, if any.
    pub const fn pages(self) -> Option<i32> {
        match self {
            Self::Idle => None,
            Self::Pending { pages, .. } | Self::Outstanding { pages, .. } => Some(pages),
        }
    }

    /// Adds `pages` of demand, moving `Idle` to `Pending { kind, pages }` or
    /// accumulating onto an existing `Pending` of the same kind. Panics if
    /// called on an `Outstanding` solicitation or one of a different kind;
    /// the matching pass (§4.4.3) never does either.
    pub fn accumulate(&mut self, kind: RequestKind, pages: i32) {
        match self {
            Self::Idle => *self = Self::Pending { kind, pages },
            Self::Pending {
                kind: existing,
                pages: existing_pages,
            } => {
                assert_eq!(*existing, kind, "accumulating onto a mismatched kind");
                *existing_pages += pages;
            }
            Self::Outstanding { .. } => {
                panic!("cannot accumulate demand onto an outstanding solicitation")
            }
        }
    }

    /// Transitions `Pending` to `Outstanding` at send time. Returns the
    /// `(kind, pages)` that should be put on the wire, or `None` if this
    /// solicitation was not `Pending`.
    pub fn dispatch(&mut self) -> Option<(RequestKind, i32)> {
        if let Self::Pending { kind, pages } = *self {
            *self = Self::Outstanding { kind, pages };
            Some((kind, pages))
        } else {
            None
        }
    }

    /// Resets to `Idle`, e.g. after a donor replies, disconnects, or a send
    /// to it fails.
    pub fn reset(&mut self) {
        *self = Self::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_accumulates_into_pending() {
        let mut s = Solicitation::Idle;
        s.accumulate(RequestKind::Request, 4);
        assert_eq!(
            s,
            Solicitation::Pending {
                kind: RequestKind::Request,
                pages: 4
            }
        );
        s.accumulate(RequestKind::Request, 6);
        assert_eq!(
            s,
            Solicitation::Pending {
                kind: RequestKind::Request,
                pages: 10
            }
        );
    }

    #[test]
    fn dispatch_transitions_pending_to_outstanding() {
        let mut s = Solicitation::Pending {
            kind: RequestKind::Reserve,
            pages: 7,
        };
        let sent = s.dispatch();
        assert_eq!(sent, Some((RequestKind::Reserve, 7)));
        assert_eq!(
            s,
            Solicitation::Outstanding {
                kind: RequestKind::Reserve,
                pages: 7
            }
        );
    }

    #[test]
    fn dispatch_on_idle_is_a_noop() {
        let mut s = Solicitation::Idle;
        assert_eq!(s.dispatch(), None);
        assert_eq!(s, Solicitation::Idle);
    }
}
