// Copyright 2025 CloudTik Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use prometheus::core::{AtomicU64, GenericCounter};
use prometheus::{
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, Histogram, IntGauge, Registry, TextEncoder,
};

/// The Prometheus surface of the scaling control loop.
pub struct ScalerMetrics {
    pub registry: Registry,

    pub running_workers: IntGauge,
    pub pending_workers: IntGauge,
    pub stopped_workers: IntGauge,

    pub started_nodes: GenericCounter<AtomicU64>,
    pub failed_updates: GenericCounter<AtomicU64>,
    pub drain_node_exceptions: GenericCounter<AtomicU64>,
    pub update_loop_failures: GenericCounter<AtomicU64>,

    pub worker_create_node_time: Histogram,
    pub update_time: Histogram,
}

impl ScalerMetrics {
    pub fn new(registry: Registry) -> Self {
        let running_workers = register_int_gauge_with_registry!(
            "cloudtik_running_workers",
            "number of worker nodes that finished bootstrapping",
            &registry
        )
        .unwrap();
        let pending_workers = register_int_gauge_with_registry!(
            "cloudtik_pending_workers",
            "number of worker nodes still bootstrapping",
            &registry
        )
        .unwrap();
        let stopped_workers = register_int_gauge_with_registry!(
            "cloudtik_stopped_workers",
            "number of worker nodes routed to stop instead of terminate",
            &registry
        )
        .unwrap();
        let started_nodes = register_int_counter_with_registry!(
            "cloudtik_started_nodes",
            "total nodes launched by the scaler",
            &registry
        )
        .unwrap();
        let failed_updates = register_int_counter_with_registry!(
            "cloudtik_failed_updates",
            "total node updates that ended in update-failed",
            &registry
        )
        .unwrap();
        let drain_node_exceptions = register_int_counter_with_registry!(
            "cloudtik_drain_node_exceptions",
            "total errors while draining nodes for termination",
            &registry
        )
        .unwrap();
        let update_loop_failures = register_int_counter_with_registry!(
            "cloudtik_update_loop_failures",
            "total scaler ticks that failed and were absorbed",
            &registry
        )
        .unwrap();
        let worker_create_node_time = register_histogram_with_registry!(
            "cloudtik_worker_create_node_time",
            "latency of provider create_node calls in seconds",
            &registry
        )
        .unwrap();
        let update_time = register_histogram_with_registry!(
            "cloudtik_update_time",
            "wall clock time of a full node update in seconds",
            &registry
        )
        .unwrap();

        Self {
            registry,
            running_workers,
            pending_workers,
            stopped_workers,
            started_nodes,
            failed_updates,
            drain_node_exceptions,
            update_loop_failures,
            worker_create_node_time,
            update_time,
        }
    }

    /// Create a new `ScalerMetrics` instance used in tests or other places.
    pub fn for_test() -> Self {
        Self::new(Registry::new())
    }
}

/// Serves the registry in Prometheus text format on `listen_addr`.
pub fn boot_metrics_service(listen_addr: String, registry: Registry) {
    tokio::spawn(async move {
        tracing::info!(
            "Prometheus listener is set up on http://{}/metrics",
            listen_addr
        );
        let service = axum::Router::new()
            .fallback(metrics_service)
            .layer(axum::Extension(registry));
        let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!("failed to bind metrics listener on {}: {}", listen_addr, err);
                return;
            }
        };
        if let Err(err) = axum::serve(listener, service).await {
            tracing::error!("metrics service exited with error: {}", err);
        }
    });
}

async fn metrics_service(
    axum::Extension(registry): axum::Extension<Registry>,
) -> impl axum::response::IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    let mf = registry.gather();
    encoder.encode(&mf, &mut buffer).unwrap();
    (
        [(
            axum::http::header::CONTENT_TYPE,
            encoder.format_type().to_string(),
        )],
        buffer,
    )
}
