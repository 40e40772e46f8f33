//! Fabric bring-up: discovery and selection, domain and address-vector
//! resources, the target endpoint that receives incoming RMA, and the
//! publication of memory-region and addressing metadata through the
//! launcher KVS.

use super::{MemoryLayout, TransportError};
use crate::config::{Params, ThreadLevel};
use crate::provider::{
    AddressVector, Caps, CounterWait, DomainHandle, Endpoint, EndpointKind, FabricDesc,
    FabricHints, MemoryRegion, MrMode, Provider, Threading,
};
use crate::runtime::{kvs_u64, RuntimeKvs};
use glob::Pattern;
use tracing::debug;

/// Static MR keys used when keys are application-chosen: heap is 1, data
/// is 0.
pub const HEAP_KEY_SCALABLE: u64 = 1;
pub const DATA_KEY_SCALABLE: u64 = 0;

/// Minimum buffered-send size the transport requires of a provider: one
/// maximal atomic operand.
pub const MIN_INJECT_SIZE: usize = 16;

const KEY_EPNAME: &str = "fi_epname";
const KEY_HEAP_KEY: &str = "fi_heap_key";
const KEY_DATA_KEY: &str = "fi_data_key";
const KEY_HEAP_ADDR: &str = "fi_heap_addr";
const KEY_DATA_ADDR: &str = "fi_data_addr";

/// Registered target-side memory regions.
pub(crate) enum TargetMrs {
    /// One registration spans the whole address space.
    Whole(Box<dyn MemoryRegion>),
    /// Separate heap and data registrations.
    Split {
        heap: Box<dyn MemoryRegion>,
        data: Box<dyn MemoryRegion>,
    },
}

/// Target-side resources, declared in teardown order.
pub(crate) struct TargetResources {
    pub ep: Box<dyn Endpoint>,
    pub mrs: TargetMrs,
    pub cntr: Option<Box<dyn crate::provider::Counter>>,
}

/// Per-PE remote keys and base addresses, populated from the KVS when the
/// provider assigns keys (basic mode) or hides base addresses (no remote
/// virtual addressing).
#[derive(Debug, Default)]
pub struct RemoteAccessTable {
    pub heap_keys: Option<Vec<u64>>,
    pub data_keys: Option<Vec<u64>>,
    pub heap_addrs: Option<Vec<u64>>,
    pub data_addrs: Option<Vec<u64>>,
}

fn compile_filter(filter: Option<&str>) -> Result<Option<Pattern>, TransportError> {
    match filter {
        None => Ok(None),
        Some(f) => Pattern::new(f)
            .map(Some)
            .map_err(|_| TransportError::BadPattern(f.to_string())),
    }
}

/// Discover fabrics matching the capability set and pick one.
///
/// With any of the provider/fabric/domain filters supplied, the first
/// glob-match wins; otherwise the provider's first offer is taken.
pub(crate) fn query_for_fabric(
    provider: &dyn Provider,
    params: &Params,
    thread_level: ThreadLevel,
) -> Result<FabricDesc, TransportError> {
    let threading = match thread_level {
        ThreadLevel::Multiple => Threading::Safe,
        _ => Threading::Domain,
    };
    let hints = FabricHints {
        caps: Caps::RMA | Caps::ATOMICS | Caps::RMA_EVENT,
        threading,
        provider_name: params.provider_filter.clone(),
        inject_size: MIN_INJECT_SIZE,
    };

    let descs = provider.discover(&hints)?;

    let prov_pat = compile_filter(params.provider_filter.as_deref())?;
    let fabric_pat = compile_filter(params.fabric_filter.as_deref())?;
    let domain_pat = compile_filter(params.domain_filter.as_deref())?;
    let filtered = prov_pat.is_some() || fabric_pat.is_some() || domain_pat.is_some();

    let selected = if filtered {
        descs.into_iter().find(|d| {
            prov_pat.as_ref().map_or(true, |p| p.matches(&d.provider_name))
                && fabric_pat.as_ref().map_or(true, |p| p.matches(&d.fabric_name))
                && domain_pat.as_ref().map_or(true, |p| p.matches(&d.domain_name))
        })
    } else {
        descs.into_iter().next()
    };

    let desc = selected.ok_or_else(|| TransportError::NoMatchingFabric {
        provider: params.provider_filter.clone(),
        fabric: params.fabric_filter.clone(),
        domain: params.domain_filter.clone(),
    })?;

    if desc.max_msg_size == 0 {
        return Err(TransportError::NoMaxMsgSize);
    }

    debug!(
        provider = %desc.provider_name,
        fabric = %desc.fabric_name,
        domain = %desc.domain_name,
        max_inject = desc.inject_size,
        max_msg = desc.max_msg_size,
        "selected fabric"
    );

    Ok(desc)
}

/// Create the target endpoint, its counter and memory regions, and enable
/// everything. Called during init, before any metadata is published.
pub(crate) fn target_ep_init(
    domain: &dyn DomainHandle,
    av: &dyn AddressVector,
    desc: &FabricDesc,
    layout: &MemoryLayout,
) -> Result<TargetResources, TransportError> {
    // Counter for incoming writes; completions on the target are observed
    // through it.
    let cntr = if desc.caps.contains(Caps::RMA_EVENT) {
        Some(domain.open_counter(CounterWait::Unspec)?)
    } else {
        None
    };

    let access = Caps::REMOTE_READ | Caps::REMOTE_WRITE;
    let rma_event = desc.mr_rma_event;
    let mrs = match (desc.mr_mode, desc.remote_va) {
        (MrMode::Scalable, true) => {
            let whole = domain.register_mr(0, u64::MAX, access, 0, rma_event)?;
            TargetMrs::Whole(whole)
        }
        (MrMode::Scalable, false) => TargetMrs::Split {
            heap: domain.register_mr(
                layout.heap_base,
                layout.heap_len,
                access,
                HEAP_KEY_SCALABLE,
                rma_event,
            )?,
            data: domain.register_mr(
                layout.data_base,
                layout.data_len,
                access,
                DATA_KEY_SCALABLE,
                rma_event,
            )?,
        },
        (MrMode::Basic, _) => TargetMrs::Split {
            heap: domain.register_mr(
                layout.heap_base,
                layout.heap_len,
                access,
                HEAP_KEY_SCALABLE,
                rma_event,
            )?,
            data: domain.register_mr(
                layout.data_base,
                layout.data_len,
                access,
                DATA_KEY_SCALABLE,
                rma_event,
            )?,
        },
    };

    // Remote-write completions count on the target counter; with MR RMA
    // events the regions must also be enabled.
    if let Some(cntr) = cntr.as_deref() {
        match &mrs {
            TargetMrs::Whole(mr) => {
                mr.bind_counter(cntr)?;
                if rma_event {
                    mr.enable()?;
                }
            }
            TargetMrs::Split { heap, data } => {
                heap.bind_counter(cntr)?;
                data.bind_counter(cntr)?;
                if rma_event {
                    heap.enable()?;
                    data.enable()?;
                }
            }
        }
    }

    let ep = domain.open_endpoint(EndpointKind::Target)?;
    ep.bind_av(av)?;
    ep.enable()?;

    Ok(TargetResources { ep, mrs, cntr })
}

/// Publish this PE's MR keys (basic mode) and segment base addresses
/// (when remote virtual addressing is off).
pub(crate) fn publish_mr_info(
    kvs: &dyn RuntimeKvs,
    desc: &FabricDesc,
    mrs: &TargetMrs,
    layout: &MemoryLayout,
) -> Result<(), TransportError> {
    if desc.mr_mode == MrMode::Basic {
        let (heap_key, data_key) = match mrs {
            TargetMrs::Split { heap, data } => (heap.key(), data.key()),
            TargetMrs::Whole(mr) => (mr.key(), mr.key()),
        };
        kvs.put(KEY_HEAP_KEY, &heap_key.to_le_bytes())?;
        kvs.put(KEY_DATA_KEY, &data_key.to_le_bytes())?;

        if !desc.remote_va {
            kvs.put(KEY_HEAP_ADDR, &layout.heap_base.to_le_bytes())?;
            kvs.put(KEY_DATA_ADDR, &layout.data_base.to_le_bytes())?;
        }
    }
    Ok(())
}

/// Read every PE's MR metadata published by [`publish_mr_info`]. Runs
/// after the KVS barrier.
pub(crate) fn populate_mr_tables(
    kvs: &dyn RuntimeKvs,
    desc: &FabricDesc,
) -> Result<RemoteAccessTable, TransportError> {
    let mut table = RemoteAccessTable::default();
    if desc.mr_mode != MrMode::Basic {
        return Ok(table);
    }

    let npes = kvs.size();
    let mut heap_keys = Vec::with_capacity(npes);
    let mut data_keys = Vec::with_capacity(npes);
    for pe in 0..npes {
        let bytes = kvs.get(pe, KEY_HEAP_KEY, 8)?;
        heap_keys.push(kvs_u64(&bytes, KEY_HEAP_KEY, pe)?);
        let bytes = kvs.get(pe, KEY_DATA_KEY, 8)?;
        data_keys.push(kvs_u64(&bytes, KEY_DATA_KEY, pe)?);
    }
    table.heap_keys = Some(heap_keys);
    table.data_keys = Some(data_keys);

    if !desc.remote_va {
        let mut heap_addrs = Vec::with_capacity(npes);
        let mut data_addrs = Vec::with_capacity(npes);
        for pe in 0..npes {
            let bytes = kvs.get(pe, KEY_HEAP_ADDR, 8)?;
            heap_addrs.push(kvs_u64(&bytes, KEY_HEAP_ADDR, pe)?);
            let bytes = kvs.get(pe, KEY_DATA_ADDR, 8)?;
            data_addrs.push(kvs_u64(&bytes, KEY_DATA_ADDR, pe)?);
        }
        table.heap_addrs = Some(heap_addrs);
        table.data_addrs = Some(data_addrs);
    }

    Ok(table)
}

/// Publish the target endpoint's fabric address. Returns the address
/// length; all endpoints are assumed to use the same one.
pub(crate) fn publish_av_info(
    kvs: &dyn RuntimeKvs,
    target_ep: &dyn Endpoint,
) -> Result<usize, TransportError> {
    let epname = target_ep.name()?;
    kvs.put(KEY_EPNAME, &epname)?;
    Ok(epname.len())
}

/// Insert every PE's endpoint address into the address vector. The
/// insertion count must equal the world size.
pub(crate) fn populate_av(
    kvs: &dyn RuntimeKvs,
    av: &dyn AddressVector,
    addrlen: usize,
) -> Result<(), TransportError> {
    let npes = kvs.size();
    let mut addrs = Vec::with_capacity(npes);
    for pe in 0..npes {
        addrs.push(kvs.get(pe, KEY_EPNAME, addrlen)?);
    }
    let inserted = av.insert(&addrs)?;
    if inserted != npes {
        return Err(TransportError::AvShortCount { inserted, expected: npes });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::loopback::{LoopbackConfig, LoopbackProvider};

    #[test]
    fn unfiltered_selection_takes_the_first_fabric() {
        let mut cfg = LoopbackConfig::default();
        cfg.extra_fabrics.push(("loop1".into(), "loop1-dom".into()));
        let prov = LoopbackProvider::new(cfg);
        let desc = query_for_fabric(&prov, &Params::default(), ThreadLevel::Single).unwrap();
        assert_eq!(desc.fabric_name, "loop0");
    }

    #[test]
    fn glob_filter_selects_a_later_fabric() {
        let mut cfg = LoopbackConfig::default();
        cfg.extra_fabrics.push(("fast9".into(), "fast9-dom".into()));
        let prov = LoopbackProvider::new(cfg);
        let mut params = Params::default();
        params.fabric_filter = Some("fast*".into());
        let desc = query_for_fabric(&prov, &params, ThreadLevel::Single).unwrap();
        assert_eq!(desc.fabric_name, "fast9");
        assert_eq!(desc.domain_name, "fast9-dom");
    }

    #[test]
    fn unmatched_filter_is_a_descriptive_error() {
        let prov = LoopbackProvider::new(LoopbackConfig::default());
        let mut params = Params::default();
        params.domain_filter = Some("mlx5_*".into());
        match query_for_fabric(&prov, &params, ThreadLevel::Single) {
            Err(TransportError::NoMatchingFabric { domain, .. }) => {
                assert_eq!(domain.as_deref(), Some("mlx5_*"));
            }
            other => panic!("expected NoMatchingFabric, got {other:?}"),
        }
    }

    #[test]
    fn bad_glob_pattern_is_rejected() {
        let prov = LoopbackProvider::new(LoopbackConfig::default());
        let mut params = Params::default();
        params.fabric_filter = Some("[".into());
        assert!(matches!(
            query_for_fabric(&prov, &params, ThreadLevel::Single),
            Err(TransportError::BadPattern(_))
        ));
    }
}
