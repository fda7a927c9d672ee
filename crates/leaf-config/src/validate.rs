//! Configuration Validation
//!
//! Resolves every reference in a parsed [`Configuration`] and checks the
//! numeric ranges. The runtime refuses to start or reload with a
//! configuration that fails here.

use crate::model::{Configuration, IntRange, Params, RuleKind, RANGE_KEYS};
use std::collections::HashMap;

/// Validate a parsed configuration
pub fn validate(config: &Configuration) -> Result<(), ValidationError> {
    for proxy in &config.proxies {
        check_ranges(&proxy.params)?;
    }
    for dns in &config.dns {
        check_ranges(&dns.params)?;
    }

    for group in &config.groups {
        if group.members.is_empty() {
            return Err(ValidationError::EmptyGroup(group.name.clone()));
        }
        for member in &group.members {
            if !config.has_outbound(member) {
                return Err(ValidationError::UnknownReference(member.clone()));
            }
        }
    }
    check_group_cycles(config)?;

    for rule in &config.rules {
        if !config.has_outbound(&rule.target) {
            return Err(ValidationError::UnknownReference(rule.target.clone()));
        }
        if let RuleKind::PortRange(range) = rule.kind {
            if !range.is_valid() || range.end > u16::MAX as i64 {
                return Err(ValidationError::BadRange {
                    key: "PORT-RANGE".into(),
                    value: range.to_string(),
                });
            }
        }
    }

    match config.rules.iter().position(|r| r.is_final()) {
        None => return Err(ValidationError::MissingFinal),
        Some(idx) if idx + 1 != config.rules.len() => return Err(ValidationError::FinalNotLast),
        Some(_) => {}
    }

    if let Some(ref name) = config.general.doh_server {
        if config.dns_entry(name).is_none() {
            return Err(ValidationError::UnknownReference(name.clone()));
        }
    }

    Ok(())
}

fn check_ranges(params: &Params) -> Result<(), ValidationError> {
    for (key, value) in params.iter() {
        if !RANGE_KEYS.contains(&key) {
            continue;
        }
        let valid = value
            .parse::<IntRange>()
            .map(|r| r.is_valid())
            .unwrap_or(false);
        if !valid {
            return Err(ValidationError::BadRange {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first walk over group membership
fn check_group_cycles(config: &Configuration) -> Result<(), ValidationError> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    fn visit<'a>(
        config: &'a Configuration,
        name: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<(), ValidationError> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(ValidationError::GroupCycle(name.to_string())),
            None => {}
        }
        let Some(group) = config.group(name) else {
            return Ok(());
        };
        marks.insert(name, Mark::Visiting);
        for member in &group.members {
            visit(config, member, marks)?;
        }
        marks.insert(name, Mark::Done);
        Ok(())
    }

    for group in &config.groups {
        visit(config, &group.name, &mut marks)?;
    }
    Ok(())
}

/// Validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown reference '{0}'")]
    UnknownReference(String),

    #[error("bad range '{value}' for '{key}'")]
    BadRange { key: String, value: String },

    #[error("proxy group '{0}' has no members")]
    EmptyGroup(String),

    #[error("proxy group '{0}' is part of a reference cycle")]
    GroupCycle(String),

    #[error("rule list must end with a FINAL rule")]
    MissingFinal,

    #[error("FINAL rule must be the last rule")]
    FinalNotLast,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn check(text: &str) -> Result<(), ValidationError> {
        validate(&parse(text).unwrap())
    }

    #[test]
    fn test_valid_failover_config() {
        let text = "[Proxy]\nA = socks, 10.0.0.1, 1080\nB = direct\n\
                    [Proxy Group]\nProxy = failover, A, B\n\
                    [Rule]\nDOMAIN-SUFFIX, example.com, B\nFINAL, Proxy\n";
        assert_eq!(check(text), Ok(()));
    }

    #[test]
    fn test_unknown_group_member() {
        let text = "[Proxy]\nA = direct\n[Proxy Group]\nP = failover, A, Ghost\n[Rule]\nFINAL, P\n";
        assert_eq!(
            check(text),
            Err(ValidationError::UnknownReference("Ghost".into()))
        );
    }

    #[test]
    fn test_unknown_rule_target() {
        let text = "[Proxy]\nA = direct\n[Rule]\nFINAL, Nowhere\n";
        assert_eq!(
            check(text),
            Err(ValidationError::UnknownReference("Nowhere".into()))
        );
    }

    #[test]
    fn test_unknown_doh_server() {
        let text = "[General]\ndoh-server = Missing\n[Proxy]\nA = direct\n[Rule]\nFINAL, A\n";
        assert_eq!(
            check(text),
            Err(ValidationError::UnknownReference("Missing".into()))
        );
    }

    #[test]
    fn test_bad_ranges() {
        let reversed = "[Proxy]\nA = trojan, h, 443, fragment=true, fragment-length=19-6\n[Rule]\nFINAL, A\n";
        assert!(matches!(check(reversed), Err(ValidationError::BadRange { .. })));

        let negative = "[Dns]\nCF = doh, 1.1.1.1, 443, fragment-interval=-1-3\n[Proxy]\nA = direct\n[Rule]\nFINAL, A\n";
        assert_eq!(
            check(negative),
            Err(ValidationError::BadRange {
                key: "fragment-interval".into(),
                value: "-1-3".into()
            })
        );

        let port = "[Proxy]\nA = direct\n[Rule]\nPORT-RANGE, 90-80, A\nFINAL, A\n";
        assert!(matches!(check(port), Err(ValidationError::BadRange { .. })));
    }

    #[test]
    fn test_final_rules() {
        assert_eq!(
            check("[Proxy]\nA = direct\n[Rule]\nDOMAIN, a.com, A\n"),
            Err(ValidationError::MissingFinal)
        );
        assert_eq!(
            check("[Proxy]\nA = direct\n[Rule]\nFINAL, A\nDOMAIN, a.com, A\n"),
            Err(ValidationError::FinalNotLast)
        );
    }

    #[test]
    fn test_group_cycle() {
        let text = "[Proxy]\nA = direct\n[Proxy Group]\nP = failover, A, Q\nQ = select, P\n[Rule]\nFINAL, P\n";
        assert!(matches!(check(text), Err(ValidationError::GroupCycle(_))));
    }

    #[test]
    fn test_empty_group() {
        let text = "[Proxy]\nA = direct\n[Proxy Group]\nP = failover\n[Rule]\nFINAL, A\n";
        assert_eq!(check(text), Err(ValidationError::EmptyGroup("P".into())));
    }

    #[test]
    fn test_roundtrip_stays_valid() {
        let text = "[General]\nloglevel = debug\ndns-server = 127.0.0.1:5123\ndoh-server = CF\n\
                    [Dns]\nCF = doh, 104.21.233.179, 443, domain=cloudflare-dns.com, fragment=true, fragment-packets=0-1\n\
                    [Proxy]\nA = socks, 10.0.0.1, 1080\nB = direct\n\
                    [Proxy Group]\nP = url-test, A, B, check-interval=60\n\
                    [Rule]\nIP-CIDR, 192.168.0.0/16, B\nFINAL, P\n";
        let config = parse(text).unwrap();
        assert_eq!(validate(&config), Ok(()));

        let again = parse(&config.to_string()).unwrap();
        assert_eq!(validate(&again), Ok(()));
        assert_eq!(again, config);
    }
}
