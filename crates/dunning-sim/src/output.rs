use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

/// Run transcript writer. Set once in main(), read by emit().
static JSONL_WRITER: OnceLock<Mutex<BufWriter<File>>> = OnceLock::new();

/// Pick a transcript path that does not exist yet, creating `dir`.
///
/// Pattern: `<dir>/sim_<mode>_<YYYYMMDD-HHMMSS>[_N].jsonl`
pub fn transcript_path(dir: &Path, mode: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let base = format!("sim_{mode}_{timestamp}");

    let first = dir.join(format!("{base}.jsonl"));
    if !first.exists() {
        return Ok(first);
    }
    (2u32..)
        .map(|i| dir.join(format!("{base}_{i}.jsonl")))
        .find(|p| !p.exists())
        .ok_or_else(|| io::Error::new(io::ErrorKind::AlreadyExists, "no free transcript name"))
}

/// Open the transcript for appending. Only the first call takes effect.
pub fn init_jsonl_writer(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    JSONL_WRITER
        .set(Mutex::new(BufWriter::new(file)))
        .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "transcript already open"))
}

/// Append one line to the transcript, if one is open.
pub fn write_jsonl_line(line: &str) {
    if let Some(writer) = JSONL_WRITER.get() {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{line}");
            let _ = w.flush();
        }
    }
}
