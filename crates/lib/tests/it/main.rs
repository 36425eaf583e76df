/*! Integration tests for meshmap.
 *
 * This test suite is organized as a single integration test binary
 * following the pattern described by matklad in
 * https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html
 *
 * The module structure mirrors the main library structure:
 * - index: Tests for the hash-position index through its public cursor API
 * - store: Tests for the entry store over heap and memory-mapped arenas
 * - codec: Tests for entry frames and message framing over real sockets
 * - map: Tests for the map facade, typed adapter and configuration loading
 * - replication: Multi-node tests for convergence, tombstones and reconnects
 */

use tracing_subscriber::EnvFilter;

#[ctor::ctor]
fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("meshmap=info".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

mod codec;
mod helpers;
mod replication;
mod store;
