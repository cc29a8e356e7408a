//! The condition compiler pipeline (§4.3): split direction filter, desugar sugar attributes,
//! resolve hostnames, convert to negation-normal form, then instrument into closures.

use super::ast::{invalid_argument, CmpOp, Expr, RawAtom};
use super::parser::parse;
use super::resolver::HostResolver;
use crate::error::FlowError;
use crate::flowkey::{Attribute, FlowCounters};
use regex::Regex;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectionFilter {
    In,
    Out,
    Uni,
    Bi,
}

impl DirectionFilter {
    pub fn matches(self, counters: &FlowCounters) -> bool {
        match self {
            DirectionFilter::In => counters.is_only_inbound(),
            DirectionFilter::Out => counters.is_only_outbound(),
            DirectionFilter::Uni => counters.is_unidirectional(),
            DirectionFilter::Bi => counters.is_bidirectional(),
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "in" | "inbound" => Some(DirectionFilter::In),
            "out" | "outbound" => Some(DirectionFilter::Out),
            "uni" | "unidirectional" => Some(DirectionFilter::Uni),
            "bi" | "bidirectional" => Some(DirectionFilter::Bi),
            _ => None,
        }
    }
}

/// The fully compiled, evaluable condition (§4.3: "exposes `Eval(key) bool` and `Attributes()`").
pub struct CompiledCondition {
    eval: Box<dyn Fn(&EvalKey) -> bool + Send + Sync>,
    attributes: HashSet<Attribute>,
    pub direction_filter: Option<DirectionFilter>,
}

impl CompiledCondition {
    pub fn eval(&self, key: &EvalKey) -> bool {
        (self.eval)(key)
    }

    pub fn attributes(&self) -> &HashSet<Attribute> {
        &self.attributes
    }
}

/// The row view a compiled condition evaluates against: exactly the 5-tuple fields a stored or
/// live flow can expose (§3).
#[derive(Clone, Copy, Debug)]
pub struct EvalKey {
    pub sip: IpAddr,
    pub dip: IpAddr,
    pub dport: u16,
    pub proto: u8,
}

fn is_dir_attr(attr: &str) -> bool {
    matches!(attr.to_ascii_lowercase().as_str(), "dir" | "direction")
}

fn contains_dir_atom(expr: &Expr) -> bool {
    match expr {
        Expr::Atom(a) => is_dir_attr(&a.attr),
        Expr::Not(e) => contains_dir_atom(e),
        Expr::And(l, r) | Expr::Or(l, r) => contains_dir_atom(l) || contains_dir_atom(r),
    }
}

fn direction_from_atom(atom: &RawAtom) -> Result<DirectionFilter, FlowError> {
    if atom.cmp != CmpOp::Eq {
        return Err(invalid_argument(
            "direction filter only supports '=' comparison",
            atom.pos,
        ));
    }
    DirectionFilter::parse(&atom.value)
        .ok_or_else(|| invalid_argument(format!("unknown direction value '{}'", atom.value), atom.pos))
}

/// Removes the single permitted direction atom from the tree, per §4.3 step 3's placement rules.
fn split_direction(expr: Expr) -> Result<(Option<Expr>, Option<DirectionFilter>), FlowError> {
    match expr {
        Expr::Atom(ref a) if is_dir_attr(&a.attr) => {
            let dir = direction_from_atom(a)?;
            Ok((None, Some(dir)))
        }
        Expr::And(l, r) => {
            let l_is_dir = matches!(&*l, Expr::Atom(a) if is_dir_attr(&a.attr));
            let r_is_dir = matches!(&*r, Expr::Atom(a) if is_dir_attr(&a.attr));
            match (l_is_dir, r_is_dir) {
                (true, true) => Err(FlowError::invalid_argument("multiple direction filters")),
                (true, false) => {
                    if contains_dir_atom(&r) {
                        return Err(FlowError::invalid_argument("multiple direction filters"));
                    }
                    let Expr::Atom(a) = *l else { unreachable!() };
                    Ok((Some(*r), Some(direction_from_atom(&a)?)))
                }
                (false, true) => {
                    if contains_dir_atom(&l) {
                        return Err(FlowError::invalid_argument("multiple direction filters"));
                    }
                    let Expr::Atom(a) = *r else { unreachable!() };
                    Ok((Some(*l), Some(direction_from_atom(&a)?)))
                }
                (false, false) => {
                    if contains_dir_atom(&l) || contains_dir_atom(&r) {
                        return Err(FlowError::invalid_argument("misplaced direction filter"));
                    }
                    Ok((Some(Expr::and(*l, *r)), None))
                }
            }
        }
        other => {
            if contains_dir_atom(&other) {
                return Err(FlowError::invalid_argument("misplaced direction filter"));
            }
            Ok((Some(other), None))
        }
    }
}

fn canonical_attr(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    match lower.as_str() {
        "src" => "sip".to_string(),
        "dst" => "dip".to_string(),
        "port" => "dport".to_string(),
        "ipproto" | "protocol" => "proto".to_string(),
        "snet" => "sip".to_string(),
        "dnet" => "dip".to_string(),
        _ => lower,
    }
}

/// Desugars `host`/`net` into OR/AND trees over `sip`/`dip`, and folds attribute aliases
/// (§4.3 step 4).
fn desugar(expr: Expr) -> Result<Expr, FlowError> {
    match expr {
        Expr::Atom(mut atom) => {
            let lower = atom.attr.to_ascii_lowercase();
            if lower == "host" || lower == "net" {
                return match atom.cmp {
                    CmpOp::Eq => Ok(Expr::or(
                        Expr::Atom(RawAtom { attr: "sip".into(), ..atom.clone() }),
                        Expr::Atom(RawAtom { attr: "dip".into(), ..atom }),
                    )),
                    CmpOp::Ne => Ok(Expr::and(
                        Expr::Atom(RawAtom { attr: "sip".into(), ..atom.clone() }),
                        Expr::Atom(RawAtom { attr: "dip".into(), ..atom }),
                    )),
                    _ => Err(invalid_argument(
                        format!("'{lower}' only supports '=' or '!='"),
                        atom.pos,
                    )),
                };
            }
            atom.attr = canonical_attr(&atom.attr);
            Ok(Expr::Atom(atom))
        }
        Expr::Not(e) => Ok(Expr::Not(Box::new(desugar(*e)?))),
        Expr::And(l, r) => Ok(Expr::and(desugar(*l)?, desugar(*r)?)),
        Expr::Or(l, r) => Ok(Expr::or(desugar(*l)?, desugar(*r)?)),
    }
}

fn is_literal_ip_or_net(value: &str) -> bool {
    if value.parse::<IpAddr>().is_ok() {
        return true;
    }
    if let Some((addr, prefix)) = value.split_once('/') {
        return addr.parse::<IpAddr>().is_ok() && prefix.parse::<u8>().is_ok();
    }
    false
}

fn hostname_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]{2,}$|^localhost$").unwrap()
    })
}

fn is_hostname(value: &str) -> bool {
    hostname_regex().is_match(value)
}

/// Resolves hostname-valued `sip`/`dip` atoms via DNS, expanding each into an OR-tree (`=`) or
/// AND-tree (`!=`) of literal-IP atoms, IPv4 ordered before IPv6 (§4.3 step 5).
fn resolve_hostnames(expr: Expr, resolver: &dyn HostResolver, timeout: Duration) -> Result<Expr, FlowError> {
    match expr {
        Expr::Atom(atom) => {
            let lower = atom.attr.to_ascii_lowercase();
            if (lower == "sip" || lower == "dip") && !is_literal_ip_or_net(&atom.value) && is_hostname(&atom.value) {
                if !matches!(atom.cmp, CmpOp::Eq | CmpOp::Ne) {
                    return Err(invalid_argument(
                        "hostname atoms only support '=' or '!='",
                        atom.pos,
                    ));
                }
                let mut ips = resolver
                    .resolve(&atom.value, timeout)
                    .map_err(|e| invalid_argument(e.message, atom.pos))?;
                ips.sort_by_key(|ip| match ip {
                    IpAddr::V4(_) => 0,
                    IpAddr::V6(_) => 1,
                });
                let mut nodes = ips.into_iter().map(|ip| {
                    Expr::Atom(RawAtom {
                        attr: atom.attr.clone(),
                        cmp: atom.cmp,
                        value: ip.to_string(),
                        pos: atom.pos,
                    })
                });
                let first = nodes.next().expect("resolver guarantees non-empty result");
                let combine = if atom.cmp == CmpOp::Eq { Expr::or } else { Expr::and };
                Ok(nodes.fold(first, combine))
            } else {
                Ok(Expr::Atom(atom))
            }
        }
        Expr::Not(e) => Ok(Expr::Not(Box::new(resolve_hostnames(*e, resolver, timeout)?))),
        Expr::And(l, r) => Ok(Expr::and(
            resolve_hostnames(*l, resolver, timeout)?,
            resolve_hostnames(*r, resolver, timeout)?,
        )),
        Expr::Or(l, r) => Ok(Expr::or(
            resolve_hostnames(*l, resolver, timeout)?,
            resolve_hostnames(*r, resolver, timeout)?,
        )),
    }
}

/// Negation-normal form: push NOT down to atoms, flipping comparators (§4.3 step 6).
fn nnf(expr: Expr, negate: bool) -> Expr {
    match expr {
        Expr::Atom(mut a) => {
            if negate {
                a.cmp = a.cmp.flip();
            }
            Expr::Atom(a)
        }
        Expr::Not(e) => nnf(*e, !negate),
        Expr::And(l, r) => {
            if negate {
                Expr::or(nnf(*l, true), nnf(*r, true))
            } else {
                Expr::and(nnf(*l, false), nnf(*r, false))
            }
        }
        Expr::Or(l, r) => {
            if negate {
                Expr::and(nnf(*l, true), nnf(*r, true))
            } else {
                Expr::or(nnf(*l, false), nnf(*r, false))
            }
        }
    }
}

fn parse_ip_or_net(value: &str) -> Option<(IpAddr, u8)> {
    if let Ok(ip) = value.parse::<IpAddr>() {
        let bits = if ip.is_ipv4() { 32 } else { 128 };
        return Some((ip, bits));
    }
    let (addr, prefix) = value.split_once('/')?;
    let ip = addr.parse::<IpAddr>().ok()?;
    let prefix = prefix.parse::<u8>().ok()?;
    Some((ip, prefix))
}

fn ip_in_network(ip: IpAddr, net: IpAddr, prefix: u8) -> bool {
    match (ip, net) {
        (IpAddr::V4(a), IpAddr::V4(b)) => {
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix.min(32)) };
            (u32::from(a) & mask) == (u32::from(b) & mask)
        }
        (IpAddr::V6(a), IpAddr::V6(b)) => {
            let mask: u128 = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix.min(128)) };
            (u128::from(a) & mask) == (u128::from(b) & mask)
        }
        _ => false,
    }
}

fn proto_id(value: &str) -> Option<u8> {
    match value.to_ascii_lowercase().as_str() {
        "tcp" => Some(6),
        "udp" => Some(17),
        "icmp" => Some(1),
        other => other.parse::<u8>().ok(),
    }
}

type Pred = Box<dyn Fn(&EvalKey) -> bool + Send + Sync>;

fn instrument_ip_atom(atom: &RawAtom, field: fn(&EvalKey) -> IpAddr) -> Result<Pred, FlowError> {
    if !matches!(atom.cmp, CmpOp::Eq | CmpOp::Ne) {
        return Err(invalid_argument(
            format!("unsupported comparator on '{}'", atom.attr),
            atom.pos,
        ));
    }
    let (net, prefix) = parse_ip_or_net(&atom.value)
        .ok_or_else(|| invalid_argument(format!("'{}' is not a valid IP or network", atom.value), atom.pos))?;
    let want_match = atom.cmp == CmpOp::Eq;
    Ok(Box::new(move |k: &EvalKey| ip_in_network(field(k), net, prefix) == want_match))
}

fn instrument_dport_atom(atom: &RawAtom) -> Result<Pred, FlowError> {
    let target: u16 = atom
        .value
        .parse()
        .map_err(|_| invalid_argument(format!("'{}' is not a valid port", atom.value), atom.pos))?;
    let cmp = atom.cmp;
    Ok(Box::new(move |k: &EvalKey| cmp.apply(k.dport, target)))
}

fn instrument_proto_atom(atom: &RawAtom) -> Result<Pred, FlowError> {
    if !matches!(atom.cmp, CmpOp::Eq | CmpOp::Ne) {
        return Err(invalid_argument("unsupported comparator on 'proto'", atom.pos));
    }
    let target = proto_id(&atom.value)
        .ok_or_else(|| invalid_argument(format!("unknown protocol '{}'", atom.value), atom.pos))?;
    let want_match = atom.cmp == CmpOp::Eq;
    Ok(Box::new(move |k: &EvalKey| (k.proto == target) == want_match))
}

/// Builds the evaluable closure tree and the set of attributes it touches (§4.3 step 7).
fn instrument(expr: &Expr) -> Result<(Pred, HashSet<Attribute>), FlowError> {
    match expr {
        Expr::Atom(atom) => match atom.attr.as_str() {
            "sip" => Ok((instrument_ip_atom(atom, |k| k.sip)?, [Attribute::Sip].into())),
            "dip" => Ok((instrument_ip_atom(atom, |k| k.dip)?, [Attribute::Dip].into())),
            "dport" => Ok((instrument_dport_atom(atom)?, [Attribute::Dport].into())),
            "proto" => Ok((instrument_proto_atom(atom)?, [Attribute::Proto].into())),
            other => Err(invalid_argument(format!("unknown attribute '{other}'"), atom.pos)),
        },
        Expr::Not(_) => unreachable!("NNF eliminates Not nodes before instrumentation"),
        Expr::And(l, r) => {
            let (lp, mut la) = instrument(l)?;
            let (rp, ra) = instrument(r)?;
            la.extend(ra);
            Ok((Box::new(move |k: &EvalKey| lp(k) && rp(k)), la))
        }
        Expr::Or(l, r) => {
            let (lp, mut la) = instrument(l)?;
            let (rp, ra) = instrument(r)?;
            la.extend(ra);
            Ok((Box::new(move |k: &EvalKey| lp(k) || rp(k)), la))
        }
    }
}

/// Runs the full pipeline: tokenize → parse → split direction → desugar → resolve hostnames →
/// NNF → instrument. `condition` may be empty, meaning "match everything".
pub fn compile(
    condition: &str,
    resolver: &dyn HostResolver,
    dns_timeout: Duration,
) -> Result<CompiledCondition, FlowError> {
    if condition.trim().is_empty() {
        return Ok(CompiledCondition {
            eval: Box::new(|_| true),
            attributes: HashSet::new(),
            direction_filter: None,
        });
    }
    let ast = parse(condition)?;
    let (remaining, direction_filter) = split_direction(ast)?;

    let Some(remaining) = remaining else {
        return Ok(CompiledCondition {
            eval: Box::new(|_| true),
            attributes: HashSet::new(),
            direction_filter,
        });
    };

    let desugared = desugar(remaining)?;
    let resolved = resolve_hostnames(desugared, resolver, dns_timeout)?;
    let normal_form = nnf(resolved, false);
    let (eval, attributes) = instrument(&normal_form)?;

    Ok(CompiledCondition {
        eval,
        attributes,
        direction_filter,
    })
}

#[cfg(test)]
mod tests {
    use super::super::resolver::StubHostResolver;
    use super::*;
    use std::net::Ipv4Addr;

    fn key(sip: &str, dip: &str, dport: u16, proto: u8) -> EvalKey {
        EvalKey {
            sip: sip.parse().unwrap(),
            dip: dip.parse().unwrap(),
            dport,
            proto,
        }
    }

    #[test]
    fn compiles_simple_eq_atom() {
        let c = compile("dport = 80", &StubHostResolver::new(), Duration::from_secs(1)).unwrap();
        assert!(c.eval(&key("1.1.1.1", "2.2.2.2", 80, 6)));
        assert!(!c.eval(&key("1.1.1.1", "2.2.2.2", 81, 6)));
        assert_eq!(c.attributes(), &[Attribute::Dport].into());
    }

    #[test]
    fn host_sugar_expands_to_sip_or_dip() {
        let c = compile("host = 10.0.0.1", &StubHostResolver::new(), Duration::from_secs(1)).unwrap();
        assert!(c.eval(&key("10.0.0.1", "9.9.9.9", 1, 6)));
        assert!(c.eval(&key("9.9.9.9", "10.0.0.1", 1, 6)));
        assert!(!c.eval(&key("8.8.8.8", "9.9.9.9", 1, 6)));
    }

    #[test]
    fn direction_filter_extracted_from_and() {
        let c = compile("dport = 80 & dir = in", &StubHostResolver::new(), Duration::from_secs(1)).unwrap();
        assert_eq!(c.direction_filter, Some(DirectionFilter::In));
        assert!(c.eval(&key("1.1.1.1", "2.2.2.2", 80, 6)));
    }

    #[test]
    fn direction_filter_alone_matches_everything_else() {
        let c = compile("dir = bi", &StubHostResolver::new(), Duration::from_secs(1)).unwrap();
        assert_eq!(c.direction_filter, Some(DirectionFilter::Bi));
        assert!(c.eval(&key("1.1.1.1", "2.2.2.2", 1, 1)));
    }

    #[test]
    fn misplaced_direction_filter_is_rejected() {
        let err = compile("dport = 80 | dir = in", &StubHostResolver::new(), Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn multiple_direction_filters_are_rejected() {
        assert!(compile("dir = in & dir = out", &StubHostResolver::new(), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn negation_pushes_to_atoms() {
        let c = compile("!(dport = 80)", &StubHostResolver::new(), Duration::from_secs(1)).unwrap();
        assert!(!c.eval(&key("1.1.1.1", "2.2.2.2", 80, 6)));
        assert!(c.eval(&key("1.1.1.1", "2.2.2.2", 81, 6)));
    }

    #[test]
    fn hostname_resolves_via_injected_resolver() {
        let resolver = StubHostResolver::new()
            .with("db.internal", vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))]);
        let c = compile("sip = db.internal", &resolver, Duration::from_secs(1)).unwrap();
        assert!(c.eval(&key("10.0.0.5", "2.2.2.2", 1, 6)));
        assert!(!c.eval(&key("10.0.0.6", "2.2.2.2", 1, 6)));
    }

    #[test]
    fn invalid_comparator_on_proto_is_rejected() {
        assert!(compile("proto < 6", &StubHostResolver::new(), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn network_literal_matches_cidr() {
        let c = compile("sip = 10.0.0.0/24", &StubHostResolver::new(), Duration::from_secs(1)).unwrap();
        assert!(c.eval(&key("10.0.0.42", "2.2.2.2", 1, 6)));
        assert!(!c.eval(&key("10.0.1.42", "2.2.2.2", 1, 6)));
    }
}
