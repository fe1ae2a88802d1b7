mod pcsc_transport;

use clap::Parser;
use crossbeam_channel::Receiver;
use emvscan::{
    ChannelDiagnostics, DedupEmitter, DiagnosticRecord, DiagnosticsSink, LogDiagnostics,
    LogEmitter, MemoryHintCache, ProtocolWalker, Settings,
};
use log::{debug, error, info, warn};
use pcsc_transport::PcscReader;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const DIAGNOSTICS_QUEUE_SIZE: usize = 64;
const REMOVAL_WAIT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(
    name = "doorreader",
    version,
    about = "Recognizes payment cards presented to PC/SC readers"
)]
struct Args {
    /// Settings file, the bundled defaults are used when it cannot be read
    #[arg(long, default_value = "config/settings.yaml")]
    settings: String,

    #[arg(long, default_value = "config/log4rs.yaml")]
    log_config: String,

    /// Only use readers whose name contains this text
    #[arg(long)]
    reader: Option<String>,

    /// Attempts that were not a clean read are appended here as YAML documents,
    /// `-` only logs them
    #[arg(long, default_value = "diagnostics.yaml")]
    diagnostics_file: String,

    /// Exit after the first card session on each reader
    #[arg(long)]
    once: bool,
}

type SharedEmitter = Arc<DedupEmitter<LogEmitter>>;

fn spawn_diagnostics_writer(
    path: String,
    records: Receiver<DiagnosticRecord>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for record in records {
            let document = match serde_yaml::to_string(&record) {
                Ok(document) => document,
                Err(err) => {
                    warn!("Could not serialize diagnostics record: {}", err);
                    continue;
                }
            };

            let written = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut file| write!(file, "---\n{}", document));
            match written {
                Ok(()) => debug!(
                    "Diagnostics for session {} written to {}",
                    record.attempt.session_id, path
                ),
                Err(err) => warn!("Could not write diagnostics to {}: {}", path, err),
            }
        }
    })
}

fn reader_worker<D: DiagnosticsSink>(
    name: CString,
    settings: Arc<Settings>,
    emitter: SharedEmitter,
    diagnostics: D,
    once: bool,
) {
    let mut reader = match PcscReader::new(name) {
        Ok(reader) => reader,
        Err(err) => {
            error!("Could not open reader: {}", err);
            return;
        }
    };
    info!("Waiting for cards on {}", reader.name());

    let mut hints = MemoryHintCache::new(settings.hint_cache_size);
    let poll_interval = Duration::from_millis(settings.reader.poll_interval_ms);
    let initial_backoff = Duration::from_millis(settings.reader.reconnect_backoff_ms);
    let max_backoff = Duration::from_millis(settings.reader.max_backoff_ms);
    let mut backoff = initial_backoff;

    loop {
        let tap = ProtocolWalker::new(&settings, &mut hints, &diagnostics, emitter.as_ref())
            .process_tap(&mut reader);

        match tap {
            Ok(Some(outcome)) => {
                backoff = initial_backoff;
                if once {
                    return;
                }

                debug!(
                    "Session {} done, waiting for the card to leave the field",
                    outcome.attempt.session_id
                );
                match reader.wait_for_removal(REMOVAL_WAIT) {
                    Ok(true) => {}
                    Ok(false) => debug!("Card still present on {}", reader.name()),
                    Err(err) => warn!("Could not watch {}: {}", reader.name(), err),
                }
            }
            Ok(None) => thread::sleep(poll_interval),
            Err(err) => {
                warn!(
                    "Reader {} failed: {}, retrying in {} ms",
                    reader.name(),
                    err,
                    backoff.as_millis()
                );
                thread::sleep(backoff);
                backoff = (backoff * 2).min(max_backoff);

                if let Err(err) = reader.reestablish() {
                    warn!("Could not re-establish PC/SC context: {}", err);
                }
            }
        }
    }
}

fn run() -> Result<(), String> {
    let args = Args::parse();

    log4rs::init_file(&args.log_config, Default::default())
        .map_err(|err| format!("Could not initialize logging from {}: {}", args.log_config, err))?;

    let settings = Arc::new(Settings::load(&args.settings).map_err(|err| err.to_string())?);
    debug!("Settings: {:?}", settings);

    let readers = pcsc_transport::list_readers(args.reader.as_deref())?;
    if readers.is_empty() {
        return Err("No readers are connected.".to_string());
    }

    let emitter: SharedEmitter = Arc::new(DedupEmitter::new(
        LogEmitter {
            censor_sensitive_fields: settings.censor_sensitive_fields,
        },
        settings.dedup_window(),
    ));

    if args.diagnostics_file == "-" {
        join_workers(spawn_workers(readers, &settings, &emitter, LogDiagnostics, args.once));
        return Ok(());
    }

    let (diagnostics, records) = ChannelDiagnostics::bounded(DIAGNOSTICS_QUEUE_SIZE);
    let writer = spawn_diagnostics_writer(args.diagnostics_file.clone(), records);

    // the writer stops once every worker has dropped its sender
    join_workers(spawn_workers(readers, &settings, &emitter, diagnostics, args.once));

    writer
        .join()
        .map_err(|_| "Diagnostics writer panicked".to_string())
}

fn spawn_workers<D: DiagnosticsSink + Clone + Send + 'static>(
    readers: Vec<CString>,
    settings: &Arc<Settings>,
    emitter: &SharedEmitter,
    diagnostics: D,
    once: bool,
) -> Vec<thread::JoinHandle<()>> {
    readers
        .into_iter()
        .map(|name| {
            let settings = Arc::clone(settings);
            let emitter = Arc::clone(emitter);
            let diagnostics = diagnostics.clone();
            thread::spawn(move || reader_worker(name, settings, emitter, diagnostics, once))
        })
        .collect()
}

fn join_workers(workers: Vec<thread::JoinHandle<()>>) {
    for worker in workers {
        if worker.join().is_err() {
            error!("Reader worker panicked");
        }
    }
}

fn main() {
    std::process::exit(match run() {
        Ok(()) => 0,
        Err(err) => {
            error!("{}", err);
            eprintln!("{}", err);
            1
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arguments() {
        let args = Args::try_parse_from(["doorreader"]).unwrap();
        assert_eq!(args.settings, "config/settings.yaml");
        assert_eq!(args.diagnostics_file, "diagnostics.yaml");
        assert!(args.reader.is_none());
        assert!(!args.once);

        let args = Args::try_parse_from([
            "doorreader",
            "--reader",
            "ACR122",
            "--diagnostics-file",
            "/var/log/doorreader/diagnostics.yaml",
            "--once",
        ])
        .unwrap();
        assert_eq!(args.reader.as_deref(), Some("ACR122"));
        assert_eq!(
            args.diagnostics_file,
            "/var/log/doorreader/diagnostics.yaml"
        );
        assert!(args.once);
    }
}
