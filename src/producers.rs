//! Producers: what an [`Action`](crate::action::Action) runs to fill its
//! destination.
//!
//! A producer is stepped until it reports [`Step::Finished`]; every
//! [`Step::Event`] it returns in between is forwarded as progress.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::MultiGzDecoder;
use serde::Serialize;
use zip::ZipArchive;

use crate::domain::InputKind;
use crate::error::PrepError;
use crate::status::{EventResult, Splice, StatusEvent, splice};

pub const COPY_CHUNK_SIZE: usize = 1024 * 1024;

/// Where a producer writes: the open in-progress file, or its path.
pub enum OutputTarget<'a> {
    File(&'a mut dyn Write),
    Path(&'a Utf8Path),
}

impl<'a> OutputTarget<'a> {
    pub fn into_writer(self) -> Result<&'a mut dyn Write, PrepError> {
        match self {
            OutputTarget::File(writer) => Ok(writer),
            OutputTarget::Path(path) => Err(PrepError::Producer(format!(
                "expected an open file, was given the path {path}"
            ))),
        }
    }

    pub fn into_path(self) -> Result<&'a Utf8Path, PrepError> {
        match self {
            OutputTarget::Path(path) => Ok(path),
            OutputTarget::File(_) => Err(PrepError::Producer(
                "expected a path, was given an open file".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Event(StatusEvent),
    Finished,
}

pub trait Producer {
    fn input(&self) -> InputKind {
        InputKind::File
    }

    fn step(&mut self, output: OutputTarget<'_>, sources: &[Utf8PathBuf]) -> Result<Step, PrepError>;
}

fn write_err(err: io::Error) -> PrepError {
    PrepError::Producer(format!("write output: {err}"))
}

fn first_source(sources: &[Utf8PathBuf]) -> Result<&Utf8Path, PrepError> {
    sources
        .first()
        .map(Utf8PathBuf::as_path)
        .ok_or_else(|| PrepError::Producer("no source file declared".to_string()))
}

fn open_source(path: &Utf8Path) -> Result<File, PrepError> {
    File::open(path.as_std_path()).map_err(|err| PrepError::Producer(format!("open {path}: {err}")))
}

/// Runs a closure once with the open output file.
pub struct WriteWith<F> {
    write: F,
}

pub fn write_with<F>(write: F) -> WriteWith<F>
where
    F: FnMut(&mut dyn Write, &[Utf8PathBuf]) -> Result<(), PrepError>,
{
    WriteWith { write }
}

impl<F> Producer for WriteWith<F>
where
    F: FnMut(&mut dyn Write, &[Utf8PathBuf]) -> Result<(), PrepError>,
{
    fn step(&mut self, output: OutputTarget<'_>, sources: &[Utf8PathBuf]) -> Result<Step, PrepError> {
        (self.write)(output.into_writer()?, sources)?;
        Ok(Step::Finished)
    }
}

/// Runs a closure once with the path of the in-progress file, for tools
/// that insist on opening their output themselves.
pub struct WithPath<F> {
    write: F,
}

pub fn with_path<F>(write: F) -> WithPath<F>
where
    F: FnMut(&Utf8Path, &[Utf8PathBuf]) -> Result<(), PrepError>,
{
    WithPath { write }
}

impl<F> Producer for WithPath<F>
where
    F: FnMut(&Utf8Path, &[Utf8PathBuf]) -> Result<(), PrepError>,
{
    fn input(&self) -> InputKind {
        InputKind::Path
    }

    fn step(&mut self, output: OutputTarget<'_>, sources: &[Utf8PathBuf]) -> Result<Step, PrepError> {
        (self.write)(output.into_path()?, sources)?;
        Ok(Step::Finished)
    }
}

#[derive(Debug, Clone)]
pub struct Bytes {
    content: Vec<u8>,
}

impl Bytes {
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

impl Producer for Bytes {
    fn step(&mut self, output: OutputTarget<'_>, _sources: &[Utf8PathBuf]) -> Result<Step, PrepError> {
        output
            .into_writer()?
            .write_all(&self.content)
            .map_err(write_err)?;
        Ok(Step::Finished)
    }
}

/// A pretty-printed JSON document, e.g. a BIDS sidecar.
#[derive(Debug, Clone)]
pub struct JsonDocument {
    value: serde_json::Value,
}

impl JsonDocument {
    pub fn new<T: Serialize>(value: &T) -> Result<Self, PrepError> {
        let value = serde_json::to_value(value)
            .map_err(|err| PrepError::Producer(format!("serialize JSON: {err}")))?;
        Ok(Self { value })
    }
}

impl Producer for JsonDocument {
    fn step(&mut self, output: OutputTarget<'_>, _sources: &[Utf8PathBuf]) -> Result<Step, PrepError> {
        let writer = output.into_writer()?;
        serde_json::to_writer_pretty(&mut *writer, &self.value)
            .map_err(|err| PrepError::Producer(format!("write JSON: {err}")))?;
        writer.write_all(b"\n").map_err(write_err)?;
        Ok(Step::Finished)
    }
}

/// A tab-separated table with a header row.
#[derive(Debug, Clone, Default)]
pub struct TsvTable {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl TsvTable {
    pub fn new<I, S>(header: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            header: header.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn row<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rows.push(values.into_iter().map(Into::into).collect());
        self
    }

    fn line(&self, values: &[String]) -> Result<String, PrepError> {
        if values.len() != self.header.len() {
            return Err(PrepError::Producer(format!(
                "row has {} columns, header has {}",
                values.len(),
                self.header.len()
            )));
        }
        if let Some(bad) = values.iter().find(|value| value.contains(['\t', '\n'])) {
            return Err(PrepError::Producer(format!(
                "value {bad:?} contains a tab or newline"
            )));
        }
        Ok(values.join("\t") + "\n")
    }
}

impl Producer for TsvTable {
    fn step(&mut self, output: OutputTarget<'_>, _sources: &[Utf8PathBuf]) -> Result<Step, PrepError> {
        let writer = output.into_writer()?;
        writer
            .write_all(self.line(&self.header)?.as_bytes())
            .map_err(write_err)?;
        for row in &self.rows {
            writer.write_all(self.line(row)?.as_bytes()).map_err(write_err)?;
        }
        Ok(Step::Finished)
    }
}

/// Streams a reader into the output chunk by chunk, reporting progress.
struct Chunked<R> {
    reader: R,
    total: Option<u64>,
    done: u64,
    buffer: Vec<u8>,
}

impl<R: Read> Chunked<R> {
    fn new(reader: R, total: Option<u64>, chunk_size: usize) -> Self {
        Self {
            reader,
            total,
            done: 0,
            buffer: vec![0; chunk_size.max(1)],
        }
    }

    fn pump(&mut self, writer: &mut dyn Write) -> Result<Step, PrepError> {
        let read = loop {
            match self.reader.read(&mut self.buffer) {
                Ok(read) => break read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(PrepError::Producer(format!("read source: {err}"))),
            }
        };
        if read == 0 {
            return Ok(Step::Finished);
        }
        writer.write_all(&self.buffer[..read]).map_err(write_err)?;
        self.done += read as u64;
        Ok(Step::Event(StatusEvent::transfer(self.done, self.total)))
    }
}

/// Copies the first source file.
pub struct CopyFile {
    chunk_size: usize,
    state: Option<Chunked<File>>,
}

impl CopyFile {
    pub fn new() -> Self {
        Self::with_chunk_size(COPY_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            state: None,
        }
    }
}

impl Default for CopyFile {
    fn default() -> Self {
        Self::new()
    }
}

impl Producer for CopyFile {
    fn step(&mut self, output: OutputTarget<'_>, sources: &[Utf8PathBuf]) -> Result<Step, PrepError> {
        let writer = output.into_writer()?;
        if self.state.is_none() {
            let source = first_source(sources)?;
            let file = open_source(source)?;
            let total = file.metadata().ok().map(|meta| meta.len());
            self.state = Some(Chunked::new(file, total, self.chunk_size));
        }
        match self.state.as_mut() {
            Some(chunked) => chunked.pump(writer),
            None => Ok(Step::Finished),
        }
    }
}

/// Decompresses the first source, a gzip file.
pub struct Gunzip {
    chunk_size: usize,
    state: Option<Chunked<MultiGzDecoder<BufReader<File>>>>,
}

impl Gunzip {
    pub fn new() -> Self {
        Self::with_chunk_size(COPY_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            state: None,
        }
    }
}

impl Default for Gunzip {
    fn default() -> Self {
        Self::new()
    }
}

impl Producer for Gunzip {
    fn step(&mut self, output: OutputTarget<'_>, sources: &[Utf8PathBuf]) -> Result<Step, PrepError> {
        let writer = output.into_writer()?;
        if self.state.is_none() {
            let file = open_source(first_source(sources)?)?;
            let decoder = MultiGzDecoder::new(BufReader::new(file));
            self.state = Some(Chunked::new(decoder, None, self.chunk_size));
        }
        match self.state.as_mut() {
            Some(chunked) => chunked.pump(writer),
            None => Ok(Step::Finished),
        }
    }
}

/// Extracts one member of the first source, a zip archive.
pub struct ZipMember {
    name: String,
    extracted: bool,
}

impl ZipMember {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extracted: false,
        }
    }
}

impl Producer for ZipMember {
    fn step(&mut self, output: OutputTarget<'_>, sources: &[Utf8PathBuf]) -> Result<Step, PrepError> {
        if self.extracted {
            return Ok(Step::Finished);
        }
        let writer = output.into_writer()?;
        let source = first_source(sources)?;
        let mut archive = ZipArchive::new(open_source(source)?)
            .map_err(|err| PrepError::Producer(format!("open zip {source}: {err}")))?;
        let mut member = archive.by_name(&self.name).map_err(|err| {
            PrepError::Producer(format!("{} not found in {source}: {err}", self.name))
        })?;
        let size = member.size();
        let copied = io::copy(&mut member, writer)
            .map_err(|err| PrepError::Producer(format!("extract {}: {err}", self.name)))?;
        self.extracted = true;
        Ok(Step::Event(StatusEvent::transfer(copied, Some(size))))
    }
}

/// Forwards the events of a nested event stream that writes the output
/// path itself.
pub struct Spliced<F, I> {
    build: Option<F>,
    stream: Option<Splice<I>>,
}

pub fn spliced<F, I>(build: F) -> Spliced<F, I::IntoIter>
where
    F: FnOnce(Utf8PathBuf, Vec<Utf8PathBuf>) -> I,
    I: IntoIterator<Item = EventResult>,
{
    Spliced {
        build: Some(build),
        stream: None,
    }
}

impl<F, I, S> Producer for Spliced<F, I>
where
    F: FnOnce(Utf8PathBuf, Vec<Utf8PathBuf>) -> S,
    S: IntoIterator<Item = EventResult, IntoIter = I>,
    I: Iterator<Item = EventResult>,
{
    fn input(&self) -> InputKind {
        InputKind::Path
    }

    fn step(&mut self, output: OutputTarget<'_>, sources: &[Utf8PathBuf]) -> Result<Step, PrepError> {
        let path = output.into_path()?;
        if let Some(build) = self.build.take() {
            self.stream = Some(splice(build(path.to_path_buf(), sources.to_vec())));
        }
        match self.stream.as_mut().and_then(|stream| stream.next()) {
            Some(Ok(event)) => Ok(Step::Event(event)),
            Some(Err(err)) => Err(err),
            None => Ok(Step::Finished),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    fn drive(producer: &mut dyn Producer, sources: &[Utf8PathBuf]) -> (Vec<u8>, Vec<StatusEvent>) {
        let mut out = Cursor::new(Vec::new());
        let mut events = Vec::new();
        loop {
            match producer.step(OutputTarget::File(&mut out), sources).unwrap() {
                Step::Event(event) => events.push(event),
                Step::Finished => break,
            }
        }
        (out.into_inner(), events)
    }

    fn root() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, root)
    }

    #[test]
    fn tsv_table() {
        let mut table = TsvTable::new(["participant_id", "age"])
            .row(["sub-IXI002", "35.8"])
            .row(["sub-IXI012", "38.8"]);
        let (bytes, events) = drive(&mut table, &[]);
        assert!(events.is_empty());
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "participant_id\tage\nsub-IXI002\t35.8\nsub-IXI012\t38.8\n"
        );
    }

    #[test]
    fn tsv_rejects_ragged_rows() {
        let mut table = TsvTable::new(["a", "b"]).row(["1"]);
        let mut out = Vec::new();
        assert!(table.step(OutputTarget::File(&mut out), &[]).is_err());
    }

    #[test]
    fn json_document_is_pretty() {
        let mut doc = JsonDocument::new(&serde_json::json!({"Name": "IXI", "BIDSVersion": "1.8.0"}))
            .unwrap();
        let (bytes, _) = drive(&mut doc, &[]);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\n  \"Name\": \"IXI\""));
        assert!(text.ends_with("}\n"));
    }

    #[test]
    fn copy_reports_progress_per_chunk() {
        let (_temp, root) = root();
        let source = root.join("T1.nii");
        std::fs::write(source.as_std_path(), vec![1u8; 250]).unwrap();
        let mut copy = CopyFile::with_chunk_size(100);
        let (bytes, events) = drive(&mut copy, &[source]);
        assert_eq!(bytes.len(), 250);
        let done: Vec<_> = events.iter().map(|event| event.done.unwrap()).collect();
        assert_eq!(done, vec![100, 200, 250]);
        assert_eq!(events[2].done_percent, Some(100.0));
    }

    #[test]
    fn gunzip_source() {
        let (_temp, root) = root();
        let source = root.join("T1.nii.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"voxel data").unwrap();
        std::fs::write(source.as_std_path(), encoder.finish().unwrap()).unwrap();

        let (bytes, _) = drive(&mut Gunzip::new(), &[source]);
        assert_eq!(bytes, b"voxel data");
    }

    #[test]
    fn zip_member() {
        let (_temp, root) = root();
        let source = root.join("IXI-T1.zip");
        let file = File::create(source.as_std_path()).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        writer.start_file("IXI002-Guys-0828-T1.nii", options).unwrap();
        writer.write_all(b"nifti").unwrap();
        writer.finish().unwrap();

        let (bytes, events) = drive(&mut ZipMember::new("IXI002-Guys-0828-T1.nii"), &[source.clone()]);
        assert_eq!(bytes, b"nifti");
        assert_eq!(events[0].done, Some(5));

        let mut missing = ZipMember::new("absent.nii");
        let mut out = Vec::new();
        assert!(missing.step(OutputTarget::File(&mut out), &[source]).is_err());
    }

    #[test]
    fn file_producers_refuse_paths() {
        let mut bytes = Bytes::new(b"x".to_vec());
        let result = bytes.step(OutputTarget::Path(Utf8Path::new("a.download")), &[]);
        assert!(matches!(result, Err(PrepError::Producer(_))));
    }
}
