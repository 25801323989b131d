//! Background upstream health probing
//!
//! Probes every upstream on a schedule and flips health flags when
//! consecutive successes or failures cross the configured thresholds. A
//! reachable upstream (any non-5xx response) counts as a success.

use crate::config::HealthCheckConfig;
use crate::gateway::route::RouteTable;
use crate::time_provider::SharedTimeProvider;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) async fn run_health_probes(
    routes: Arc<RouteTable>,
    client: reqwest::Client,
    config: HealthCheckConfig,
    time: SharedTimeProvider,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = time.sleep(config.interval) => {}
        }
        for route in routes.routes() {
            for upstream in route.upstreams.all() {
                let reachable = match client
                    .get(&upstream.url)
                    .timeout(PROBE_TIMEOUT)
                    .send()
                    .await
                {
                    Ok(response) => !response.status().is_server_error(),
                    Err(_) => false,
                };
                if reachable {
                    upstream.record_success(config.healthy_threshold);
                } else {
                    upstream.record_failure(config.unhealthy_threshold);
                }
                debug!(upstream = %upstream.url, reachable, "health probe");
            }
        }
    }
}
