//! NDJSON page files, with optional gzip compression.
//!
//! Pages roll when their uncompressed size would pass a threshold, and
//! every page is written to a temporary name, fsynced, and renamed into
//! place, so readers never observe a partial page.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;

use crate::error::{Result, StoreError};

/// Default roll threshold: 1 GiB uncompressed, matching common bulk
/// export file sizes.
pub const DEFAULT_PAGE_THRESHOLD: u64 = 1024 * 1024 * 1024;

/// `<Type>.<PPP>.ndjson[.gz]`
pub fn page_filename(res_type: &str, page: u32, compress: bool) -> String {
    let suffix = if compress { ".gz" } else { "" };
    format!("{res_type}.{page:03}.ndjson{suffix}")
}

pub fn is_compressed(path: &Path) -> bool {
    path.extension().map(|ext| ext == "gz").unwrap_or(false)
}

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Sink {
    fn create(path: &Path, compress: bool, append: bool) -> Result<Self> {
        let file = if append {
            fs::OpenOptions::new().create(true).append(true).open(path)?
        } else {
            File::create(path)?
        };
        let buffered = BufWriter::new(file);
        Ok(if compress {
            Sink::Gzip(GzEncoder::new(buffered, Compression::default()))
        } else {
            Sink::Plain(buffered)
        })
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Sink::Plain(w) => w.write_all(buf),
            Sink::Gzip(w) => w.write_all(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
        }
    }

    /// Flush buffers, finish any compression stream, and fsync.
    fn finish(self) -> std::io::Result<()> {
        let buffered = match self {
            Sink::Plain(w) => w,
            Sink::Gzip(w) => w.finish()?,
        };
        let file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }
}

/// A rolling NDJSON writer for one resource type within a sub-export.
///
/// Page files are created lazily, so an empty result produces no file at
/// all rather than a zero-line one.
pub struct PageWriter {
    dir: PathBuf,
    res_type: String,
    compress: bool,
    threshold: u64,
    page: u32,
    written: u64,
    sink: Option<Sink>,
    tmp_path: Option<PathBuf>,
    pages: Vec<PathBuf>,
    count: u64,
}

impl PageWriter {
    pub fn new(dir: impl Into<PathBuf>, res_type: impl Into<String>, start_page: u32, compress: bool) -> Self {
        Self {
            dir: dir.into(),
            res_type: res_type.into(),
            compress,
            threshold: DEFAULT_PAGE_THRESHOLD,
            page: start_page.max(1),
            written: 0,
            sink: None,
            tmp_path: None,
            pages: Vec::new(),
            count: 0,
        }
    }

    pub fn with_threshold(mut self, bytes: u64) -> Self {
        self.threshold = bytes.max(1);
        self
    }

    /// Serialize one resource as a compact JSON line.
    pub fn append(&mut self, resource: &Value) -> Result<()> {
        let mut line = serde_json::to_vec(resource)?;
        line.push(b'\n');

        if self.sink.is_some() && self.written + line.len() as u64 > self.threshold {
            self.roll()?;
        }
        if self.sink.is_none() {
            self.open_page()?;
        }

        self.sink
            .as_mut()
            .expect("page opened above")
            .write_all(&line)?;
        self.written += line.len() as u64;
        self.count += 1;
        Ok(())
    }

    /// Total resources written across all pages.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// The page index the next record would land in.
    pub fn current_page(&self) -> u32 {
        self.page
    }

    /// Close the current page and return the finished page paths.
    pub fn finish(mut self) -> Result<Vec<PathBuf>> {
        self.close_page()?;
        Ok(std::mem::take(&mut self.pages))
    }

    fn open_page(&mut self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let final_name = page_filename(&self.res_type, self.page, self.compress);
        let tmp_path = self.dir.join(format!("{final_name}.tmp"));
        self.sink = Some(Sink::create(&tmp_path, self.compress, false)?);
        self.tmp_path = Some(tmp_path);
        self.written = 0;
        Ok(())
    }

    fn roll(&mut self) -> Result<()> {
        self.close_page()?;
        self.page += 1;
        Ok(())
    }

    fn close_page(&mut self) -> Result<()> {
        if let Some(sink) = self.sink.take() {
            sink.finish()?;
            let tmp_path = self.tmp_path.take().expect("tmp path set with sink");
            let final_path = self
                .dir
                .join(page_filename(&self.res_type, self.page, self.compress));
            fs::rename(&tmp_path, &final_path)?;
            self.pages.push(final_path);
        }
        Ok(())
    }
}

impl Drop for PageWriter {
    fn drop(&mut self) {
        // A dropped (not finished) writer leaves only the .tmp file, which
        // the next run treats as a discarded partial.
        if let Some(tmp) = self.tmp_path.take() {
            self.sink.take();
            let _ = fs::remove_file(tmp);
        }
    }
}

/// A single-file NDJSON writer, for logs, deleted-ID files, and page
/// rewrites.
///
/// In append mode, lines go straight to the target and are flushed per
/// write. Otherwise writes go to a temporary file that replaces the
/// target atomically on `finish`.
pub struct NdjsonFileWriter {
    path: PathBuf,
    write_path: PathBuf,
    append: bool,
    compress: bool,
    sink: Option<Sink>,
    count: u64,
}

impl NdjsonFileWriter {
    pub fn create(path: impl Into<PathBuf>, append: bool) -> Self {
        let path = path.into();
        let compress = is_compressed(&path);
        let write_path = if append {
            path.clone()
        } else {
            let mut tmp = path.clone().into_os_string();
            tmp.push(".tmp");
            PathBuf::from(tmp)
        };
        Self {
            path,
            write_path,
            append,
            compress,
            sink: None,
            count: 0,
        }
    }

    pub fn write(&mut self, value: &Value) -> Result<()> {
        if self.sink.is_none() {
            if let Some(parent) = self.write_path.parent() {
                fs::create_dir_all(parent)?;
            }
            self.sink = Some(Sink::create(&self.write_path, self.compress, self.append)?);
        }
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let sink = self.sink.as_mut().expect("sink opened above");
        sink.write_all(&line)?;
        if self.append {
            sink.flush()?;
        }
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Close the file; renames over the target in non-append mode.
    pub fn finish(mut self) -> Result<u64> {
        if let Some(sink) = self.sink.take() {
            sink.finish()?;
            if self.write_path != self.path {
                fs::rename(&self.write_path, &self.path)?;
            }
        }
        Ok(self.count)
    }
}

/// A byte-stream writer for one downloaded page file.
///
/// Bulk export servers hand us finished NDJSON bodies; we stream the
/// chunks straight to disk (compressing if asked) without parsing them.
/// The uncompressed byte count is recorded so an interrupted run can
/// verify a file on resume.
pub struct RawPageWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    sink: Option<Sink>,
    bytes: u64,
}

impl RawPageWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp_path = PathBuf::from(tmp);
        let sink = Sink::create(&tmp_path, is_compressed(&path), false)?;
        Ok(Self {
            path,
            tmp_path,
            sink: Some(sink),
            bytes: 0,
        })
    }

    pub fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.sink
            .as_mut()
            .expect("writer not finished")
            .write_all(chunk)?;
        self.bytes += chunk.len() as u64;
        Ok(())
    }

    /// Uncompressed bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Fsync and rename into place; returns the uncompressed size.
    pub fn finish(mut self) -> Result<u64> {
        let sink = self.sink.take().expect("writer not finished");
        sink.finish()?;
        fs::rename(&self.tmp_path, &self.path)?;
        Ok(self.bytes)
    }
}

impl Drop for RawPageWriter {
    fn drop(&mut self) {
        if self.sink.take().is_some() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// Uncompressed byte count of an NDJSON file, for resume verification.
pub fn decompressed_size(path: &Path) -> Result<u64> {
    let file = File::open(path)?;
    let mut reader: Box<dyn Read> = if is_compressed(path) {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut total = 0u64;
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            return Ok(total);
        }
        total += read as u64;
    }
}

/// Stream `(line_number, value)` records out of one NDJSON file,
/// transparently decompressing. Line numbers are 1-based.
pub fn read_file(path: &Path) -> Result<impl Iterator<Item = Result<(usize, Value)>>> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if is_compressed(path) {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let path = path.to_path_buf();

    Ok(BufReader::new(reader)
        .lines()
        .enumerate()
        .filter_map(move |(index, line)| {
            let line_no = index + 1;
            match line {
                Err(err) => Some(Err(StoreError::Io(err))),
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(serde_json::from_str::<Value>(&line).map(|v| (line_no, v)).map_err(
                    |err| StoreError::MalformedLine {
                        path: path.clone(),
                        line: line_no,
                        source: err,
                    },
                )),
            }
        }))
}

/// All NDJSON files for one resource type in a directory, sorted by name.
///
/// Matches `Type.ndjson[.gz]` and any `Type.<something>.ndjson[.gz]`.
/// The dot after the type name keeps `Medication` from matching
/// `MedicationRequest` files.
pub fn list_resource_files(dir: &Path, res_type: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() && !entry.file_type()?.is_symlink() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let matches_type =
            name == format!("{res_type}.ndjson") || name == format!("{res_type}.ndjson.gz") || {
                name.starts_with(&format!("{res_type}."))
                    && (name.ends_with(".ndjson") || name.ends_with(".ndjson.gz"))
            };
        if matches_type {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Read every resource of a type from a directory, skipping malformed
/// lines with a warning. Files are visited in name order.
pub fn collect_resources(dir: &Path, res_type: &str) -> Result<Vec<Value>> {
    let mut resources = Vec::new();
    for path in list_resource_files(dir, res_type)? {
        for record in read_file(&path)? {
            match record {
                Ok((_, value)) => resources.push(value),
                Err(err @ StoreError::MalformedLine { .. }) => {
                    tracing::warn!(error = %err, "Skipping malformed NDJSON line");
                }
                Err(err) => return Err(err),
            }
        }
    }
    Ok(resources)
}

/// Count the lines of an NDJSON file.
pub fn line_count(path: &Path) -> Result<u64> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if is_compressed(path) {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut count = 0;
    for line in BufReader::new(reader).lines() {
        if !line?.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}
