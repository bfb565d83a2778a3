//! Session descriptor exchange rules.
//!
//! Pure checks over an endpoint's phase; nothing here touches a transport.
//! Offerer path: `new -> offering -> offered -> connected`.
//! Answerer path: `new -> answering -> connected`.

use crate::error::{Error, Result};
use crate::peer::state::EndpointState;
use crate::peer::types::{EndpointId, SdpKind, SessionPhase, Transition};

/// Which side of the exchange a descriptor is being applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

/// `createOffer` is only valid on a fresh endpoint
pub fn check_create_offer(endpoint: EndpointId, state: &EndpointState) -> Result<()> {
    match state.phase {
        SessionPhase::New => Ok(()),
        SessionPhase::Closed => Err(Error::SessionClosed { endpoint }),
        phase => Err(Error::Negotiation {
            endpoint,
            transition: Transition::CreateOffer,
            reason: format!("endpoint is in phase {phase}, expected new"),
        }),
    }
}

/// `createAnswer` needs a remote offer to answer
pub fn check_create_answer(endpoint: EndpointId, state: &EndpointState) -> Result<()> {
    if state.phase == SessionPhase::Closed {
        return Err(Error::SessionClosed { endpoint });
    }
    match &state.remote_description {
        Some(d) if d.kind == SdpKind::Offer && state.phase == SessionPhase::Answering => Ok(()),
        Some(d) => Err(Error::Negotiation {
            endpoint,
            transition: Transition::CreateAnswer,
            reason: format!(
                "remote description is an {} in phase {}, expected an offer",
                d.kind, state.phase
            ),
        }),
        None => Err(Error::Negotiation {
            endpoint,
            transition: Transition::CreateAnswer,
            reason: "no remote offer has been set".into(),
        }),
    }
}

/// Phase reached after applying a descriptor of `kind` on `side`.
///
/// Fails with [`Error::ProtocolSequence`] when the descriptor type does not
/// fit the current phase; the caller must leave the phase untouched then.
pub fn next_phase(
    endpoint: EndpointId,
    phase: SessionPhase,
    side: Side,
    kind: SdpKind,
) -> Result<SessionPhase> {
    use SessionPhase::*;

    let next = match (phase, side, kind) {
        (Closed, _, _) => return Err(Error::SessionClosed { endpoint }),
        (New | Offering, Side::Local, SdpKind::Offer) => Offered,
        (New, Side::Remote, SdpKind::Offer) => Answering,
        (Answering, Side::Local, SdpKind::Answer) => Connected,
        (Offered, Side::Remote, SdpKind::Answer) => Connected,
        _ => {
            let side = match side {
                Side::Local => "local",
                Side::Remote => "remote",
            };
            return Err(Error::ProtocolSequence {
                endpoint,
                phase,
                attempted: format!("applying {side} {kind}"),
            });
        }
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::SessionDescriptor;

    const ME: EndpointId = EndpointId::Local;

    #[test]
    fn offerer_path() {
        let p = next_phase(ME, SessionPhase::Offering, Side::Local, SdpKind::Offer).unwrap();
        assert_eq!(p, SessionPhase::Offered);
        let p = next_phase(ME, p, Side::Remote, SdpKind::Answer).unwrap();
        assert_eq!(p, SessionPhase::Connected);
    }

    #[test]
    fn answerer_path() {
        let p = next_phase(ME, SessionPhase::New, Side::Remote, SdpKind::Offer).unwrap();
        assert_eq!(p, SessionPhase::Answering);
        let p = next_phase(ME, p, Side::Local, SdpKind::Answer).unwrap();
        assert_eq!(p, SessionPhase::Connected);
    }

    #[test]
    fn out_of_order_descriptors_are_sequence_errors() {
        let bad = [
            (SessionPhase::New, Side::Remote, SdpKind::Answer),
            (SessionPhase::New, Side::Local, SdpKind::Answer),
            (SessionPhase::Offered, Side::Remote, SdpKind::Offer),
            (SessionPhase::Answering, Side::Remote, SdpKind::Offer),
            (SessionPhase::Answering, Side::Local, SdpKind::Offer),
            (SessionPhase::Connected, Side::Remote, SdpKind::Answer),
        ];
        for (phase, side, kind) in bad {
            match next_phase(ME, phase, side, kind) {
                Err(Error::ProtocolSequence { phase: p, .. }) => assert_eq!(p, phase),
                other => panic!("{phase} {side:?} {kind}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn closed_endpoint_rejects_everything_as_closed() {
        let r = next_phase(ME, SessionPhase::Closed, Side::Remote, SdpKind::Offer);
        assert!(matches!(r, Err(Error::SessionClosed { .. })));
    }

    #[test]
    fn create_offer_requires_new() {
        let mut state = EndpointState::default();
        assert!(check_create_offer(ME, &state).is_ok());
        state.phase = SessionPhase::Offered;
        assert!(matches!(
            check_create_offer(ME, &state),
            Err(Error::Negotiation {
                transition: Transition::CreateOffer,
                ..
            })
        ));
    }

    #[test]
    fn create_answer_requires_remote_offer() {
        let mut state = EndpointState::default();
        assert!(matches!(
            check_create_answer(ME, &state),
            Err(Error::Negotiation { .. })
        ));

        state.phase = SessionPhase::Answering;
        state.remote_description = Some(SessionDescriptor::offer("v=0".into(), "s".into()));
        assert!(check_create_answer(ME, &state).is_ok());
    }
}
