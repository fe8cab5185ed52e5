use anyhow::{anyhow, Context, Result};
use candle_pipeline::config::PipelineConfig;
use candle_pipeline::cursor::CursorStore;
use candle_pipeline::ingest::{self, IngestStats};
use candle_pipeline::landing::LandingBuffer;
use candle_pipeline::merge::{self, MergeScheduler};
use candle_pipeline::store::FactStore;
use candle_pipeline::telemetry;
use candle_pipeline::timestamp::LandedAtClock;
use candle_pipeline::transform::{TransformStats, TransformView};
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

fn open_input(cfg: &PipelineConfig) -> Result<Box<dyn BufRead + Send>> {
    match &cfg.input {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("open input {path:?}"))?;
            Ok(Box::new(BufReader::with_capacity(1 << 20, file)))
        }
        None => Ok(Box::new(BufReader::new(io::stdin()))),
    }
}

/// Land the input, returning the offset one past the last landed entry.
fn lander_thread(
    input: Box<dyn BufRead + Send>,
    mut landing: LandingBuffer,
    follow: Option<Duration>,
    shutdown: Arc<AtomicBool>,
) -> Result<(IngestStats, u64)> {
    let stats = ingest::land_lines(input, &mut landing, follow, &shutdown).context("land input")?;
    landing.sync().context("sync landing log")?;
    Ok((stats, landing.next_offset()))
}

fn join_transform(handle: JoinHandle<Result<TransformStats>>) -> Result<TransformStats> {
    handle.join().map_err(|_| anyhow!("transform thread panicked"))?
}

fn main() -> Result<()> {
    let cfg = PipelineConfig::load();
    telemetry::init();

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            info!("interrupt received, shutting down");
            shutdown.store(true, Ordering::Release);
        })
        .context("install Ctrl+C handler")?;
    }

    let store = Arc::new(FactStore::open(&cfg.facts_dir(), cfg.store_options()).context("open fact store")?);
    let landing = LandingBuffer::open(&cfg.landing_dir(), cfg.landing_options()).context("open landing log")?;
    let cursor = CursorStore::open(&cfg.cursor_dir()).context("open transform cursor")?;

    let view = TransformView::new(
        Arc::clone(&store),
        cursor,
        LandedAtClock::system(),
        cfg.transform_options(),
        Arc::clone(&shutdown),
    );
    let progress = view.progress();
    let subscription = landing.subscribe(view.start_offset(), cfg.poll_interval(), Arc::clone(&shutdown));
    info!(
        data_dir = %cfg.data_dir.display(),
        landed = landing.next_offset(),
        resume_from = view.start_offset(),
        "pipeline starting"
    );

    let transform = std::thread::Builder::new()
        .name("transform".into())
        .spawn(move || {
            let mut view = view;
            view.run(subscription).map_err(anyhow::Error::from)
        })
        .context("spawn transform thread")?;

    let merger = MergeScheduler::spawn(Arc::clone(&store), cfg.merge_interval()).context("start merge scheduler")?;

    let input = open_input(&cfg)?;
    let follow = cfg.follow.then(|| cfg.poll_interval());
    let (done_tx, done_rx) = bounded::<Result<(IngestStats, u64)>>(1);
    {
        let shutdown = Arc::clone(&shutdown);
        std::thread::Builder::new()
            .name("lander".into())
            .spawn(move || {
                let _ = done_tx.send(lander_thread(input, landing, follow, shutdown));
            })
            .context("spawn lander thread")?;
    }

    // Run until Ctrl+C, or until the input is drained and fully transformed.
    let mut drain_target: Option<u64> = None;
    let mut outcome: Result<()> = Ok(());
    while !shutdown.load(Ordering::Acquire) {
        if transform.is_finished() {
            break;
        }
        if let Some(target) = drain_target {
            if progress.load(Ordering::Acquire) >= target {
                info!(offset = target, "input drained and transformed");
                break;
            }
            std::thread::sleep(cfg.poll_interval());
            continue;
        }
        match done_rx.recv_timeout(Duration::from_millis(250)) {
            Ok(Ok((stats, next_offset))) => {
                info!(landed = stats.landed, blank_lines = stats.blank_lines, "lander finished");
                drain_target = Some(next_offset);
            }
            Ok(Err(e)) => {
                error!(error = %format!("{e:#}"), "lander failed");
                outcome = Err(e);
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                outcome = Err(anyhow!("lander thread exited without reporting"));
                break;
            }
        }
    }

    // The lander may still be blocked on stdin; it is not joined.
    shutdown.store(true, Ordering::Release);
    let joined = join_transform(transform);
    merger.stop();
    let stats = joined.context("transform view")?;

    if drain_target.is_some() && !cfg.no_final_merge {
        merge::merge_once(&store);
    }
    let store_stats = store.stats();
    info!(
        processed = stats.processed,
        append_retries = stats.append_retries,
        empty_tickers = stats.empty_tickers,
        parts = store_stats.parts,
        rows = store_stats.total_rows,
        superseded = store_stats.superseded_rows(),
        "pipeline stopped"
    );
    if stats.empty_tickers > 0 {
        warn!(rows = stats.empty_tickers, "some payloads landed without a ticker");
    }
    outcome
}
