//! Provider atomic-capability validation.
//!
//! At startup the runtime sweeps the (datatype, operation) matrix it
//! depends on and asks the provider for its limits. Reductions carry soft
//! support (they can be emulated above the transport); everything else is
//! an error unless the user demotes it to warnings.

use super::TransportError;
use crate::provider::{AmoDt, AmoOp, Endpoint};
use tracing::warn;

/// Severity applied per category when a combination is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicSupport {
    /// Hard fail on any missing combination.
    NoSupport,
    /// Log and continue.
    Warnings,
    /// Silently continue; the operation is emulated in software.
    SoftSupport,
}

#[derive(Debug, Clone, Copy)]
enum Query {
    Base,
    Fetch,
    Compare,
}

/// Standard AMO operand types.
const DT_AMO_STANDARD: &[AmoDt] = &[AmoDt::Int32, AmoDt::Int64, AmoDt::Uint32, AmoDt::Uint64];
const AMO_STANDARD_OPS: &[AmoOp] = &[AmoOp::Sum];
const FETCH_AMO_STANDARD_OPS: &[AmoOp] = &[AmoOp::Sum];
const COMPARE_AMO_STANDARD_OPS: &[AmoOp] = &[AmoOp::Cswap];

/// Extended AMO adds the floating types.
const DT_AMO_EXTENDED: &[AmoDt] = &[
    AmoDt::Float,
    AmoDt::Double,
    AmoDt::Int32,
    AmoDt::Int64,
    AmoDt::Uint32,
    AmoDt::Uint64,
];
const AMO_EXTENDED_OPS: &[AmoOp] = &[AmoOp::AtomicWrite];
const FETCH_AMO_EXTENDED_OPS: &[AmoOp] = &[AmoOp::AtomicWrite, AmoOp::AtomicRead];

/// One-sided reduction coverage.
const DT_REDUCE_BITWISE: &[AmoDt] = &[AmoDt::Int32, AmoDt::Int64, AmoDt::Uint32, AmoDt::Uint64];
const REDUCE_BITWISE_OPS: &[AmoOp] = &[AmoOp::Band, AmoOp::Bor, AmoOp::Bxor];

const DT_REDUCE_COMPARE: &[AmoDt] = &[
    AmoDt::Float,
    AmoDt::Double,
    AmoDt::Int32,
    AmoDt::Int64,
    AmoDt::Uint32,
    AmoDt::Uint64,
];
const REDUCE_COMPARE_OPS: &[AmoOp] = &[AmoOp::Max, AmoOp::Min];

const DT_REDUCE_ARITH: &[AmoDt] = &[
    AmoDt::Float,
    AmoDt::Double,
    AmoDt::Int32,
    AmoDt::Int64,
    AmoDt::Uint32,
    AmoDt::Uint64,
];
const REDUCE_ARITH_OPS: &[AmoOp] = &[AmoOp::Sum, AmoOp::Prod];

/// Internal requirement: the lock implementation needs masked swap on int.
const DT_INTERNAL_REQ: &[AmoDt] = &[AmoDt::Int32];
const INTERNAL_REQ_OPS: &[AmoOp] = &[AmoOp::Mswap];

fn check_one(
    result: Result<usize, crate::provider::ProviderError>,
    support: AtomicSupport,
    dt: AmoDt,
    op: AmoOp,
) -> Result<(), TransportError> {
    let missing = match result {
        Ok(count) => count == 0,
        Err(_) => true,
    };
    if missing && support != AtomicSupport::SoftSupport {
        warn!(op = op.name(), datatype = dt.name(), "provider does not support atomic");
        if support != AtomicSupport::Warnings {
            return Err(TransportError::AtomicUnsupported { dt, op });
        }
    }
    Ok(())
}

fn check_matrix(
    ep: &dyn Endpoint,
    dts: &[AmoDt],
    ops: &[AmoOp],
    query: Query,
    support: AtomicSupport,
) -> Result<(), TransportError> {
    for &dt in dts {
        for &op in ops {
            let result = match query {
                Query::Base => ep.atomic_valid(dt, op),
                Query::Fetch => ep.fetch_atomic_valid(dt, op),
                Query::Compare => ep.compare_atomic_valid(dt, op),
            };
            check_one(result, support, dt, op)?;
        }
    }
    Ok(())
}

/// Sweep every matrix the runtime depends on against the provider.
pub fn atomic_limitations_check(
    ep: &dyn Endpoint,
    checks_warn: bool,
) -> Result<(), TransportError> {
    let general = if checks_warn {
        AtomicSupport::Warnings
    } else {
        AtomicSupport::NoSupport
    };
    let reduction = AtomicSupport::SoftSupport;

    check_matrix(ep, DT_AMO_STANDARD, AMO_STANDARD_OPS, Query::Base, general)?;
    check_matrix(ep, DT_AMO_STANDARD, FETCH_AMO_STANDARD_OPS, Query::Fetch, general)?;
    check_matrix(ep, DT_AMO_STANDARD, COMPARE_AMO_STANDARD_OPS, Query::Compare, general)?;

    check_matrix(ep, DT_AMO_EXTENDED, AMO_EXTENDED_OPS, Query::Base, general)?;
    check_matrix(ep, DT_AMO_EXTENDED, FETCH_AMO_EXTENDED_OPS, Query::Fetch, general)?;

    check_matrix(ep, DT_REDUCE_BITWISE, REDUCE_BITWISE_OPS, Query::Base, reduction)?;
    check_matrix(ep, DT_REDUCE_COMPARE, REDUCE_COMPARE_OPS, Query::Base, reduction)?;
    check_matrix(ep, DT_REDUCE_ARITH, REDUCE_ARITH_OPS, Query::Base, reduction)?;

    check_matrix(ep, DT_INTERNAL_REQ, INTERNAL_REQ_OPS, Query::Compare, general)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::loopback::{LoopbackConfig, LoopbackProvider};
    use crate::provider::{Caps, EndpointKind, FabricHints, Provider, Threading};

    fn endpoint(cfg: LoopbackConfig) -> Box<dyn Endpoint> {
        let prov = LoopbackProvider::new(cfg);
        let hints = FabricHints {
            caps: Caps::RMA | Caps::ATOMICS,
            threading: Threading::Domain,
            provider_name: None,
            inject_size: 16,
        };
        let desc = prov.discover(&hints).unwrap().remove(0);
        let fabric = prov.open_fabric(&desc).unwrap();
        let domain = fabric.open_domain(&desc).unwrap();
        domain.open_endpoint(EndpointKind::Transmit).unwrap()
    }

    #[test]
    fn full_support_passes() {
        let ep = endpoint(LoopbackConfig::default());
        assert!(atomic_limitations_check(ep.as_ref(), false).is_ok());
    }

    #[test]
    fn missing_standard_amo_is_fatal_by_default() {
        let mut cfg = LoopbackConfig::default();
        cfg.denied_atomics.push((AmoDt::Int64, AmoOp::Sum));
        let ep = endpoint(cfg);
        assert!(matches!(
            atomic_limitations_check(ep.as_ref(), false),
            Err(TransportError::AtomicUnsupported { dt: AmoDt::Int64, op: AmoOp::Sum })
        ));
    }

    #[test]
    fn warnings_mode_continues_past_missing_amo() {
        let mut cfg = LoopbackConfig::default();
        cfg.denied_atomics.push((AmoDt::Int64, AmoOp::Sum));
        let ep = endpoint(cfg);
        assert!(atomic_limitations_check(ep.as_ref(), true).is_ok());
    }

    #[test]
    fn missing_reduction_is_soft() {
        let mut cfg = LoopbackConfig::default();
        cfg.denied_atomics.push((AmoDt::Double, AmoOp::Prod));
        let ep = endpoint(cfg);
        // PROD on double only appears in the arithmetic-reduce matrix.
        assert!(atomic_limitations_check(ep.as_ref(), false).is_ok());
    }
}
