//! Durable output for a finished [`TimeSeries`].

use std::{
    error, fmt,
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use log::info;

use crate::{config::OutputConfig, series::TimeSeries};

/// Column order of the CSV export. Downstream analysis depends on it.
pub const CSV_HEADER: &str =
    "Time,InternalFrag_Bytes,ExternalFrag_Ratio,TotalFree_Bytes,BiggestBlock_Bytes,TotalUserRequested";

#[non_exhaustive]
#[derive(Debug)]
pub enum SinkError {
    IoError(io::Error),
    SerdeJsonError(serde_json::Error),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::IoError(e) => write!(f, "could not write results: {e}"),
            SinkError::SerdeJsonError(e) => write!(f, "could not serialize results: {e}"),
        }
    }
}

impl error::Error for SinkError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            SinkError::IoError(e) => Some(e),
            SinkError::SerdeJsonError(e) => Some(e),
        }
    }
}

impl From<io::Error> for SinkError {
    fn from(e: io::Error) -> Self {
        SinkError::IoError(e)
    }
}

/// Somewhere a finished series can be written. Writing does not consume the
/// series, so a failed write loses nothing.
pub trait ResultSink {
    fn write_series(&mut self, series: &TimeSeries) -> Result<(), SinkError>;
}

pub struct CsvSink<W>
where
    W: Write,
{
    writer: W,
}

impl<W> CsvSink<W>
where
    W: Write,
{
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl CsvSink<BufWriter<File>> {
    pub fn create<P>(path: P) -> Result<Self, SinkError>
    where
        P: AsRef<Path>,
    {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W> ResultSink for CsvSink<W>
where
    W: Write,
{
    fn write_series(&mut self, series: &TimeSeries) -> Result<(), SinkError> {
        writeln!(self.writer, "{CSV_HEADER}")?;
        for s in series {
            writeln!(
                self.writer,
                "{},{},{},{},{},{}",
                s.time_step,
                s.internal_fragmentation,
                s.external_fragmentation_ratio,
                s.total_free_on_heap,
                s.biggest_free_block,
                s.total_user_requested
            )?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

pub struct JsonSink<W>
where
    W: Write,
{
    writer: W,
}

impl<W> JsonSink<W>
where
    W: Write,
{
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl JsonSink<BufWriter<File>> {
    pub fn create<P>(path: P) -> Result<Self, SinkError>
    where
        P: AsRef<Path>,
    {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W> ResultSink for JsonSink<W>
where
    W: Write,
{
    fn write_series(&mut self, series: &TimeSeries) -> Result<(), SinkError> {
        serde_json::to_writer_pretty(&mut self.writer, series).map_err(SinkError::SerdeJsonError)?;
        writeln!(self.writer)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Write `series` to every sink `output` names, carrying on past a failed
/// one. Returns each failure with the path it was writing to.
pub fn write_outputs(series: &TimeSeries, output: &OutputConfig) -> Vec<(PathBuf, SinkError)> {
    let mut failures = Vec::new();

    info!("writing results to {}", output.csv.display());
    if let Err(e) = CsvSink::create(&output.csv).and_then(|mut sink| sink.write_series(series)) {
        failures.push((output.csv.clone(), e));
    }
    if let Some(path) = &output.json {
        info!("writing results to {}", path.display());
        if let Err(e) = JsonSink::create(path).and_then(|mut sink| sink.write_series(series)) {
            failures.push((path.clone(), e));
        }
    }

    failures
}
