//! worldsim — drive a whole PGAS world in one process.
//!
//! Spawns one thread per PE over the in-process simulation collaborators,
//! runs the full transport bring-up, a strided split, a 2-D split and some
//! context churn, then tears everything down and reports the invariants.

use clap::Parser;
use pgasrt::provider::loopback::{LoopbackConfig, LoopbackProvider};
use pgasrt::provider::Provider;
use pgasrt::sim::SimWorld;
use pgasrt::{
    team_my_pe, CtxOptions, MemoryLayout, Params, TeamManager, ThreadLevel, TransportState,
};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "worldsim", version, about = "pgasrt in-process world simulation")]
struct Args {
    /// Number of PEs to simulate
    #[arg(short, long, default_value = "4")]
    npes: usize,

    /// Maximum simultaneous teams
    #[arg(short, long, default_value = "16")]
    teams_max: usize,

    /// STX pool size per PE
    #[arg(short, long, default_value = "4")]
    stx_max: usize,

    /// Contexts each PE creates and destroys
    #[arg(short, long, default_value = "8")]
    ctx_churn: usize,
}

fn pe_main(world: SimWorld, provider: Arc<LoopbackProvider>, pe: usize, args: &Args) -> Result<(), String> {
    let sim = world.pe(pe);

    let mut params = Params::from_env();
    params.teams_max = args.teams_max;
    params.stx_max.value = args.stx_max;

    // Fake segment placement; a real launcher hands in the symmetric heap.
    let layout = MemoryLayout {
        heap_base: 0x1000_0000,
        heap_len: 1 << 24,
        data_base: 0x2000_0000,
        data_len: 1 << 20,
    };

    let provider: Arc<dyn Provider> = provider;
    let mut transport =
        TransportState::init(provider, sim.kvs.clone(), params, ThreadLevel::Multiple, layout)
            .map_err(|e| format!("pe {pe}: init failed: {e}"))?;
    transport.startup().map_err(|e| format!("pe {pe}: startup failed: {e}"))?;

    let mut teams = TeamManager::init(
        args.teams_max,
        pe,
        world.npes(),
        sim.heap.clone(),
        sim.collectives.clone(),
    )
    .map_err(|e| format!("pe {pe}: teams init failed: {e}"))?;

    info!(pe, stx_max = transport.stx_max(), "transport up");

    // Strided split: every other PE.
    let world_team = teams.world().clone();
    let half = (world.npes() + 1) / 2;
    let even = teams
        .split_strided(&world_team, 0, 2, half, None, 0)
        .map_err(|e| format!("pe {pe}: strided split failed: {e}"))?;
    info!(pe, my_pe_in_even = team_my_pe(even.as_ref()), "strided split done");

    // Grid split when the world is big enough.
    if world.npes() >= 4 {
        let (x, y) = teams
            .split_2d(&world_team, 2, None, 0, None, 0)
            .map_err(|e| format!("pe {pe}: 2d split failed: {e}"))?;
        info!(
            pe,
            x = team_my_pe(x.as_ref()),
            y = team_my_pe(y.as_ref()),
            "2d split done"
        );
        if let Some(t) = x {
            teams.destroy(t);
        }
        if let Some(t) = y {
            teams.destroy(t);
        }
    }

    // Context churn: alternate private and bounce-buffered contexts.
    for i in 0..args.ctx_churn {
        let options = if i % 2 == 0 {
            CtxOptions::PRIVATE
        } else {
            CtxOptions::BOUNCE_BUFFER
        };
        let ctx = transport
            .ctx_create(options)
            .map_err(|e| format!("pe {pe}: ctx_create failed: {e}"))?;
        ctx.quiet().map_err(|e| format!("pe {pe}: quiet failed: {e}"))?;
        transport
            .ctx_destroy(ctx)
            .map_err(|e| format!("pe {pe}: ctx_destroy failed: {e}"))?;
    }

    let ref_sum = transport.stx_ref_sum();
    let live = transport.live_ctx_count();
    if ref_sum != live as u64 {
        return Err(format!(
            "pe {pe}: invariant violated: stx ref sum {ref_sum} != live contexts {live}"
        ));
    }
    info!(pe, ref_sum, live, mask = %format!("{:#b}", teams.reservation_mask()), "invariants hold");

    if let Some(t) = even {
        teams.destroy(t);
    }
    teams.fini();
    transport.fini().map_err(|e| format!("pe {pe}: fini failed: {e}"))?;
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(npes = args.npes, "starting world simulation");

    let world = SimWorld::new(args.npes);
    let provider = Arc::new(LoopbackProvider::new(LoopbackConfig::default()));
    let ledger = provider.ledger();

    let handles: Vec<_> = (0..args.npes)
        .map(|pe| {
            let world = world.clone();
            let provider = Arc::clone(&provider);
            let args = Args {
                npes: args.npes,
                teams_max: args.teams_max,
                stx_max: args.stx_max,
                ctx_churn: args.ctx_churn,
            };
            std::thread::spawn(move || pe_main(world, provider, pe, &args))
        })
        .collect();

    let mut failed = false;
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(msg)) => {
                error!("{msg}");
                failed = true;
            }
            Err(_) => {
                error!("PE thread panicked");
                failed = true;
            }
        }
    }

    let leaked = ledger.total();
    if leaked != 0 {
        error!(leaked, "provider handles leaked");
        failed = true;
    }

    if failed {
        std::process::exit(1);
    }
    info!("world simulation complete, no leaks");
}
