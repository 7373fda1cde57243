use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::{first_party, parse_caveat, Caveat, Namespace, COND_TIME_BEFORE, STD_NAMESPACE};
use crate::format::RawMacaroon;

/// a caveat that expires the macaroon at `t`
pub fn time_before_caveat(t: OffsetDateTime) -> Caveat {
    match t.format(&Rfc3339) {
        Ok(formatted) => first_party(COND_TIME_BEFORE, &formatted),
        Err(e) => super::error_caveat(&format!("cannot format expiry time: {}", e)),
    }
}

/// earliest expiry time found in a macaroon's first party caveats
///
/// conditions are interpreted with `ns`, `time-before` caveats that do not
/// parse are ignored
pub fn expiry_time(ns: &Namespace, caveats: &[crate::format::RawCaveat]) -> Option<OffsetDateTime> {
    let prefix = ns.resolve(STD_NAMESPACE)?;
    let time_before = super::condition_with_prefix(prefix, COND_TIME_BEFORE);

    caveats
        .iter()
        .filter(|c| c.is_first_party())
        .filter_map(|c| std::str::from_utf8(&c.id).ok())
        .filter_map(|condition| {
            let (name, arg) = parse_caveat(condition).ok()?;
            if name != time_before {
                return None;
            }
            OffsetDateTime::parse(arg, &Rfc3339).ok()
        })
        .min()
}

/// earliest expiry time of a macaroon and its discharges
pub fn macaroons_expiry_time(ns: &Namespace, macaroons: &[RawMacaroon]) -> Option<OffsetDateTime> {
    macaroons
        .iter()
        .filter_map(|m| expiry_time(ns, m.caveats()))
        .min()
}
