//! Pagination Harness
//!
//! Visual regression testing for a browser-rendered pagination engine:
//! - One shared headless browser and one static fixture server per run
//! - A per-test-file environment that attaches to the shared browser
//! - PDF page snapshots rasterized with poppler and compared to baselines
//! - Idempotent teardown that leaves everything in place in debug mode
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │             pagination-harness run -- <test cmd>            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  GlobalSetup::run() -> SharedSession                        │
//! │    ├── FixtureServer::start()      (axum + ServeDir)        │
//! │    ├── BrowserProcess::launch()    (--remote-debugging)     │
//! │    └── EndpointRecord::write()     (<work_dir>/ws-endpoint) │
//! │  <test cmd>  (one process per test file, in parallel)       │
//! │  global_teardown(session)                                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TestFile (harness = false test binary)                     │
//! │    ├── BrowserEnvironment::setup()  -> browser, origin      │
//! │    ├── case(ctx)                                            │
//! │    │     ├── ctx.open(fixture) -> FixturePage               │
//! │    │     ├── page.pdf() -> RenderedArtifact                 │
//! │    │     └── ctx.match_pdf(pdf, page)                       │
//! │    │           ├── Rasterizer::rasterize()  (pdftoppm)      │
//! │    │           └── SnapshotStore::compare() (baseline)      │
//! │    └── BrowserEnvironment::teardown()                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod browser;
pub mod config;
pub mod endpoint;
pub mod environment;
pub mod error;
pub mod fixtures;
pub mod launcher;
pub mod matcher;
pub mod page;
pub mod rasterize;
pub mod report;
pub mod snapshot;
pub mod suite;
pub mod teardown;

pub use config::{BaselineMode, HarnessConfig};
pub use environment::{BrowserEnvironment, EnvContext, TestEnvironment};
pub use error::{HarnessError, HarnessResult};
pub use launcher::{GlobalSetup, SharedSession};
pub use matcher::SnapshotMatcher;
pub use page::{FixturePage, OpenPages, PdfMargins, PdfOptions, RenderedArtifact, Tab};
pub use rasterize::{PopplerRasterizer, Rasterizer};
pub use snapshot::{SnapshotStatus, SnapshotStore, VisualDiff};
pub use suite::{CaseContext, TestFile};
pub use teardown::global_teardown;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the fmt subscriber. `RUST_LOG` wins unless debug is on. Calling
/// it again is a no-op.
pub fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("info,pagination_harness=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
