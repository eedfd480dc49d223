//! Job execution: gate, supervisor, progress propagation, result ingestion,
//! and the per-kind lanes that drive them from the durable queue.

pub mod attack;
pub mod capture;
pub mod gate;
pub mod ingest;
pub mod lanes;
pub mod progress;
pub mod supervisor;

use std::sync::Arc;

use crackq_db::models::queue::LaneKind;

use crate::state::AppState;
use attack::AttackLane;
use capture::CaptureLane;
use lanes::{LaneHandler, LaneRouter};

/// Build the lane router for the server.
///
/// The dictionary-build handler lives outside this crate; without one the
/// lane is not started and its queue items stay unclaimed.
pub fn lane_router(state: &AppState, dictionary: Option<Arc<dyn LaneHandler>>) -> LaneRouter {
    let config = &state.config;
    let attack = AttackLane::new(
        Arc::clone(&state.store),
        Arc::clone(&state.propagator),
        Arc::clone(&state.event_bus),
        &config.engine,
        &config.lanes,
    );
    let capture = CaptureLane::new(
        Arc::clone(&state.store),
        Arc::clone(&state.event_bus),
        &config.engine,
    );

    let router = LaneRouter::new(
        Arc::clone(&state.queue),
        config.lanes.poll_interval,
        config.lanes.lease,
    )
    .with_lane(LaneKind::Attack, config.lanes.attack_concurrency, Arc::new(attack))
    .with_lane(
        LaneKind::CaptureProcessing,
        config.lanes.capture_concurrency,
        Arc::new(capture),
    );

    match dictionary {
        Some(handler) => router.with_lane(
            LaneKind::DictionaryBuild,
            config.lanes.dictionary_concurrency,
            handler,
        ),
        None => {
            tracing::info!("No dictionary-build handler registered, lane disabled");
            router
        }
    }
}
