//! Connection request context
//!
//! The application attaches a free-form context string to each request.
//! Only two flags are recognised; anything else, including garbage, yields
//! an empty context.

use meshlink_protocol::{PeerId, Tier};
use std::time::Instant;

/// Flags parsed from a request's context string
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionContext {
    pub emergency: bool,
    pub family: bool,
}

impl ConnectionContext {
    /// Parse case-insensitive `emergency`/`critical` and `family` tokens
    ///
    /// Tokens are separated by anything that is not alphanumeric, so
    /// `"Emergency"`, `"family,urgent"` and `"type=emergency"` all work.
    pub fn parse(raw: &str) -> Self {
        let mut context = ConnectionContext::default();
        for token in raw
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            if token.eq_ignore_ascii_case("emergency") || token.eq_ignore_ascii_case("critical") {
                context.emergency = true;
            } else if token.eq_ignore_ascii_case("family") {
                context.family = true;
            }
        }
        context
    }

    /// Tier a request with this context is admitted at
    ///
    /// Emergency always means Critical. Family raises to at least High but
    /// never lowers a better recommendation.
    pub fn effective_tier(&self, recommended: Tier) -> Tier {
        if self.emergency {
            Tier::Critical
        } else if self.family {
            recommended.max(Tier::High)
        } else {
            recommended
        }
    }
}

/// A peer asking to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub peer: PeerId,
    pub arrived_at: Instant,
    pub requested_tier: Tier,
    pub context: ConnectionContext,
}

impl ConnectionRequest {
    pub fn new(peer: PeerId, recommended: Tier, context: ConnectionContext, now: Instant) -> Self {
        ConnectionRequest {
            peer,
            arrived_at: now,
            requested_tier: context.effective_tier(recommended),
            context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        assert!(ConnectionContext::parse("EMERGENCY").emergency);
        assert!(ConnectionContext::parse("critical").emergency);
        assert!(ConnectionContext::parse("Family").family);

        let both = ConnectionContext::parse("family; emergency");
        assert!(both.emergency && both.family);
    }

    #[test]
    fn test_parse_garbage_yields_nothing() {
        assert_eq!(ConnectionContext::parse(""), ConnectionContext::default());
        assert_eq!(
            ConnectionContext::parse("{\"x\": [1, 2"),
            ConnectionContext::default()
        );
        // Substrings do not count
        assert_eq!(
            ConnectionContext::parse("nonemergency familyish"),
            ConnectionContext::default()
        );
        assert_eq!(ConnectionContext::parse("\u{0}\u{fffd}"), ConnectionContext::default());
    }

    #[test]
    fn test_effective_tier() {
        let emergency = ConnectionContext::parse("emergency");
        assert_eq!(emergency.effective_tier(Tier::Low), Tier::Critical);

        let family = ConnectionContext::parse("family");
        assert_eq!(family.effective_tier(Tier::Low), Tier::High);
        assert_eq!(family.effective_tier(Tier::Critical), Tier::Critical);

        let plain = ConnectionContext::default();
        assert_eq!(plain.effective_tier(Tier::Normal), Tier::Normal);
    }

    #[test]
    fn test_request_carries_effective_tier() {
        let peer = PeerId::new("p").unwrap();
        let request = ConnectionRequest::new(
            peer,
            Tier::Normal,
            ConnectionContext::parse("family"),
            Instant::now(),
        );
        assert_eq!(request.requested_tier, Tier::High);
    }
}
