use anyhow::{Context, Result};
use candle_pipeline::config::{FACTS_SUBDIR, LANDING_SUBDIR};
use candle_pipeline::landing::{self, LandingBuffer};
use candle_pipeline::record::CandleFact;
use candle_pipeline::store::{self, FactFilter};
use candle_pipeline::telemetry;
use candle_pipeline::timestamp::Timestamp;
use clap::Parser;
use std::collections::HashSet;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(about = "Read candle facts (or the raw landing log) from a pipeline data directory")]
struct Args {
    /// Pipeline data directory (as passed to candle-pipeline)
    #[arg(long, env = "CANDLE_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Only rows for this ticker
    #[arg(long, short = 't')]
    ticker: Option<String>,

    /// Only rows opening at or after this time
    #[arg(long, value_parser = parse_time)]
    from: Option<Timestamp>,

    /// Only rows opening before this time
    #[arg(long, value_parser = parse_time)]
    until: Option<Timestamp>,

    /// Collapse versions at read time, as a merge would
    #[arg(long = "final", default_value_t = false)]
    final_rows: bool,

    /// Print one JSON object per row instead of a table
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Newest `open_dt` first, at most this many rows
    #[arg(long, short = 'n')]
    limit: Option<usize>,

    /// Dump the landing log instead of the fact store
    #[arg(long, default_value_t = false)]
    landing: bool,

    /// Print row, identity and superseded-version counts only
    #[arg(long, default_value_t = false)]
    stats: bool,
}

fn parse_time(raw: &str) -> Result<Timestamp, String> {
    Timestamp::parse_best_effort(raw).ok_or_else(|| format!("unrecognised timestamp {raw:?}"))
}

fn print_fact<W: Write>(out: &mut W, f: &CandleFact, json: bool) -> Result<()> {
    if json {
        let row = serde_json::json!({
            "ticker": f.ticker,
            "open_price": f.open_price,
            "close_price": f.close_price,
            "sma": f.sma,
            "std": f.std,
            "avg_price": f.avg_price,
            "close_to_open_ratio": f.close_to_open_ratio,
            "open_dt": f.open_dt.to_string(),
            "close_dt": f.close_dt.to_string(),
            "landed_at": f.landed_at.to_string(),
        });
        writeln!(out, "{row}")?;
    } else {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            f.ticker,
            f.open_dt,
            f.close_dt,
            f.open_price,
            f.close_price,
            f.sma,
            f.std,
            f.avg_price,
            f.close_to_open_ratio,
            f.landed_at
        )?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    telemetry::init();
    let mut out = BufWriter::new(io::stdout().lock());

    if args.landing {
        let dir = args.data_dir.join(LANDING_SUBDIR);
        let messages = LandingBuffer::read_all(&dir)
            .with_context(|| format!("read {:?}", landing::landing_path(&dir)))?;
        for m in &messages {
            if args.json {
                let row = serde_json::json!({
                    "offset": m.offset,
                    "partition": m.partition,
                    "consumed_at": m.consumed_at.to_string(),
                    "payload": m.payload,
                });
                writeln!(out, "{row}")?;
            } else {
                writeln!(out, "{}\t{}\t{}", m.offset, m.consumed_at, m.payload)?;
            }
        }
        out.flush()?;
        return Ok(());
    }

    let facts_dir = args.data_dir.join(FACTS_SUBDIR);
    let filter = FactFilter {
        ticker: args.ticker.clone(),
        open_from: args.from,
        open_until: args.until,
    };
    let mut rows: Vec<CandleFact> = store::read_snapshot(&facts_dir)
        .with_context(|| format!("read fact store {facts_dir:?}"))?
        .into_iter()
        .filter(|r| filter.matches(r))
        .collect();

    if args.stats {
        let identities: HashSet<_> = rows.iter().map(CandleFact::key).collect();
        writeln!(
            out,
            "rows={} identities={} superseded={}",
            rows.len(),
            identities.len(),
            rows.len() - identities.len()
        )?;
        out.flush()?;
        return Ok(());
    }

    if args.final_rows {
        rows = store::collapse_versions(rows);
    }
    if let Some(limit) = args.limit {
        rows.sort_by(|a, b| b.open_dt.cmp(&a.open_dt));
        rows.truncate(limit);
    }
    if !args.json {
        writeln!(out, "ticker\topen_dt\tclose_dt\topen\tclose\tsma\tstd\tavg\tclose_to_open\tlanded_at")?;
    }
    for r in &rows {
        print_fact(&mut out, r, args.json)?;
    }
    out.flush()?;
    Ok(())
}
