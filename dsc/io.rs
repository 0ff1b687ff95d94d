// ========================================================================================
//                          Tab-separated inputs and result files
// ========================================================================================

use crate::decompose::Decomposition;
use crate::dispatch::PermutationOutputs;
use crate::matrix::{ExpressionMatrix, MatrixDims, MatrixError};
use crate::numeric::saturate_extreme;
use crate::summary::PermutationSummary;
use ahash::{AHashMap, AHashSet};
use csv::{ReaderBuilder, StringRecord};
use log::{info, warn};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Cell tokens read as a missing value.
const MISSING_TOKENS: [&str; 5] = ["", "NA", "NaN", "nan", "null"];

#[derive(Error, Debug)]
pub enum IoError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read tab-separated input: {0}")]
    Csv(#[from] csv::Error),

    #[error("'{0}' has no header line.")]
    MissingHeader(PathBuf),

    #[error("Line {line} has {found} fields, but the header has {expected}.")]
    RaggedRow {
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("Line {line}, column {column}: '{token}' is not a number.")]
    BadNumber {
        line: u64,
        column: usize,
        token: String,
    },

    #[error("Sample '{0}' appears more than once.")]
    DuplicateSample(String),

    #[error("Sample '{0}' has no entry in the batch file.")]
    SampleMissing(String),

    #[error("Batch type '{requested}' is not in the batch file (available: {available:?}).")]
    UnknownBatchType {
        requested: String,
        available: Vec<String>,
    },

    #[error("Matrix file is not a valid expression matrix: {0}")]
    Matrix(#[from] MatrixError),
}

/// An expression matrix together with its row and column identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledMatrix {
    pub gene_ids: Vec<String>,
    pub sample_ids: Vec<String>,
    pub matrix: ExpressionMatrix,
}

/// Per-sample batch labels for one or more batch types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchTable {
    batch_types: Vec<String>,
    rows: AHashMap<String, Vec<String>>,
}

fn tsv_reader(path: &Path) -> Result<csv::Reader<File>, IoError> {
    Ok(ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_path(path)?)
}

fn line_of(record: &StringRecord) -> u64 {
    record.position().map_or(0, |p| p.line())
}

fn parse_cell(token: &str, line: u64, column: usize) -> Result<f64, IoError> {
    let token = token.trim();
    if MISSING_TOKENS.contains(&token) {
        return Ok(f64::NAN);
    }
    lexical_core::parse::<f64>(token.as_bytes()).map_err(|_| IoError::BadNumber {
        line,
        column,
        token: token.to_owned(),
    })
}

/// Reads a matrix whose header is `<corner>\t<sample>...` and whose rows are
/// `<gene>\t<value>...`.
pub fn read_matrix(path: &Path) -> Result<LabeledMatrix, IoError> {
    let mut reader = tsv_reader(path)?;
    let mut record = StringRecord::new();

    if !reader.read_record(&mut record)? {
        return Err(IoError::MissingHeader(path.to_path_buf()));
    }
    let sample_ids: Vec<String> = record.iter().skip(1).map(|s| s.trim().to_owned()).collect();
    let mut seen = AHashSet::with_capacity(sample_ids.len());
    for sample in &sample_ids {
        if !seen.insert(sample.as_str()) {
            return Err(IoError::DuplicateSample(sample.clone()));
        }
    }

    let expected = sample_ids.len() + 1;
    let mut gene_ids = Vec::new();
    let mut values = Vec::new();
    while reader.read_record(&mut record)? {
        let line = line_of(&record);
        if record.len() != expected {
            return Err(IoError::RaggedRow {
                line,
                expected,
                found: record.len(),
            });
        }
        gene_ids.push(record[0].trim().to_owned());
        for (column, token) in record.iter().enumerate().skip(1) {
            values.push(parse_cell(token, line, column + 1)?);
        }
    }

    let dims = MatrixDims {
        genes: gene_ids.len(),
        samples: sample_ids.len(),
    };
    let matrix = ExpressionMatrix::from_row_major(&values, dims)?;
    info!(
        "Read {} genes × {} samples from '{}'.",
        dims.genes,
        dims.samples,
        path.display()
    );
    Ok(LabeledMatrix {
        gene_ids,
        sample_ids,
        matrix,
    })
}

/// Reads a batch file whose header is `Sample\t<type>...`.
pub fn read_batches(path: &Path) -> Result<BatchTable, IoError> {
    let mut reader = tsv_reader(path)?;
    let mut record = StringRecord::new();

    if !reader.read_record(&mut record)? {
        return Err(IoError::MissingHeader(path.to_path_buf()));
    }
    let batch_types: Vec<String> = record.iter().skip(1).map(|s| s.trim().to_owned()).collect();
    let expected = batch_types.len() + 1;

    let mut rows = AHashMap::new();
    while reader.read_record(&mut record)? {
        if record.len() != expected {
            return Err(IoError::RaggedRow {
                line: line_of(&record),
                expected,
                found: record.len(),
            });
        }
        let sample = record[0].trim().to_owned();
        let labels = record.iter().skip(1).map(|s| s.trim().to_owned()).collect();
        if rows.insert(sample.clone(), labels).is_some() {
            return Err(IoError::DuplicateSample(sample));
        }
    }
    Ok(BatchTable { batch_types, rows })
}

impl BatchTable {
    pub fn batch_types(&self) -> &[String] {
        &self.batch_types
    }

    /// Labels for `sample_ids`, in that order, under `batch_type` (default: the
    /// first type in the file). Samples present only in the batch file are ignored.
    pub fn assignment_for(
        &self,
        sample_ids: &[String],
        batch_type: Option<&str>,
    ) -> Result<Vec<String>, IoError> {
        let unknown = |requested: &str| IoError::UnknownBatchType {
            requested: requested.to_owned(),
            available: self.batch_types.clone(),
        };
        let column = match batch_type {
            Some(name) => self
                .batch_types
                .iter()
                .position(|t| t == name)
                .ok_or_else(|| unknown(name))?,
            None if self.batch_types.is_empty() => return Err(unknown("<first>")),
            None => 0,
        };

        let labels = sample_ids
            .iter()
            .map(|sample| {
                self.rows
                    .get(sample)
                    .map(|labels| labels[column].clone())
                    .ok_or_else(|| IoError::SampleMissing(sample.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let extra = self.rows.len().saturating_sub(sample_ids.len());
        if extra > 0 {
            warn!("Ignoring {extra} samples in the batch file that are not in the matrix.");
        }
        Ok(labels)
    }
}

/// The four result files that share one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub dispersion: PathBuf,
    pub permutation_globals: PathBuf,
    pub permutation_genes: PathBuf,
    pub pvalues: PathBuf,
}

impl OutputPaths {
    pub fn from_prefix(prefix: &Path) -> Self {
        let with_suffix = |suffix: &str| {
            let mut name = OsString::from(prefix.as_os_str());
            name.push(suffix);
            PathBuf::from(name)
        };
        Self {
            dispersion: with_suffix(".dsc.tsv"),
            permutation_globals: with_suffix(".perm_global.tsv"),
            permutation_genes: with_suffix(".perm_genes.tsv"),
            pvalues: with_suffix(".pvalues.tsv"),
        }
    }
}

/// The matrix path without its extension.
pub fn default_prefix(matrix_path: &Path) -> PathBuf {
    matrix_path.with_extension("")
}

/// Writes through `body` into a hidden temporary file next to `path`, then renames
/// it into place. On failure the temporary file is removed and `path` is untouched.
fn write_atomically(
    path: &Path,
    body: impl FnOnce(&mut BufWriter<File>) -> io::Result<()>,
) -> io::Result<()> {
    let output_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let output_name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Output path '{}' has no file name.", path.display()),
        )
    })?;

    let pid = std::process::id();
    let ts_nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut opened = None;
    for attempt in 0..32u32 {
        let candidate = output_dir.join(format!(
            ".{}.{}.{}.tmp",
            output_name.to_string_lossy(),
            pid,
            ts_nanos + attempt as u128
        ));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(file) => {
                opened = Some((candidate, file));
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    let (temp_path, temp_file) = opened.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "Failed to allocate a unique temporary output file in '{}'.",
                output_dir.display()
            ),
        )
    })?;

    let mut writer = BufWriter::new(temp_file);
    let write_result = body(&mut writer).and_then(|()| {
        writer.flush()?;
        let file = writer.into_inner().map_err(io::Error::other)?;
        file.sync_all()
    });

    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    fs::rename(&temp_path, path).inspect_err(|_| {
        let _ = fs::remove_file(&temp_path);
    })
}

/// Formats statistics with `ryu`, optionally saturating extremes first.
struct ValueFormatter {
    buffer: ryu::Buffer,
    saturate: bool,
}

impl ValueFormatter {
    fn new(saturate: bool) -> Self {
        Self {
            buffer: ryu::Buffer::new(),
            saturate,
        }
    }

    fn statistic(&mut self, value: f64) -> &str {
        let value = if self.saturate {
            saturate_extreme(value)
        } else {
            value
        };
        self.buffer.format(value)
    }

    fn probability(&mut self, value: f64) -> &str {
        self.buffer.format(value)
    }
}

fn write_triple(
    writer: &mut impl Write,
    formatter: &mut ValueFormatter,
    dsc: f64,
    db: f64,
    dw: f64,
) -> io::Result<()> {
    write!(writer, "\t{}", formatter.statistic(dsc))?;
    write!(writer, "\t{}", formatter.statistic(db))?;
    writeln!(writer, "\t{}", formatter.statistic(dw))
}

/// Writes the observed global and per-gene statistics.
pub fn write_dispersion(
    path: &Path,
    gene_ids: &[String],
    observed: &Decomposition,
    saturate: bool,
) -> io::Result<()> {
    let mut formatter = ValueFormatter::new(saturate);
    write_atomically(path, |writer| {
        write!(writer, "#OVERALL")?;
        let global = observed.global;
        write_triple(writer, &mut formatter, global.dsc, global.db, global.dw)?;
        writeln!(writer, "GENE\tDSC\tDB\tDW")?;
        for (gene, id) in gene_ids.iter().enumerate() {
            write!(writer, "{id}")?;
            write_triple(
                writer,
                &mut formatter,
                observed.gene_dsc[gene],
                observed.gene_db[gene],
                observed.gene_dw[gene],
            )?;
        }
        Ok(())
    })
}

/// Writes one global triple per permutation, numbered from 1.
pub fn write_permutation_globals(
    path: &Path,
    outputs: &PermutationOutputs,
    saturate: bool,
) -> io::Result<()> {
    let mut formatter = ValueFormatter::new(saturate);
    write_atomically(path, |writer| {
        writeln!(writer, "PERMUTATION\tDSC\tDB\tDW")?;
        for j in 0..outputs.permutations() {
            let global = outputs.global(j);
            write!(writer, "{}", j + 1)?;
            write_triple(writer, &mut formatter, global.dsc, global.db, global.dw)?;
        }
        Ok(())
    })
}

/// Writes the per-gene null statistics, one line per permutation and gene.
pub fn write_permutation_genes(
    path: &Path,
    gene_ids: &[String],
    outputs: &PermutationOutputs,
    saturate: bool,
) -> io::Result<()> {
    let mut formatter = ValueFormatter::new(saturate);
    write_atomically(path, |writer| {
        writeln!(writer, "PERMUTATION\tGENE\tDSC\tDB\tDW")?;
        for j in 0..outputs.permutations() {
            let (dsc, db, dw) = outputs.gene_block(j);
            for (gene, id) in gene_ids.iter().enumerate() {
                write!(writer, "{}\t{id}", j + 1)?;
                write_triple(writer, &mut formatter, dsc[gene], db[gene], dw[gene])?;
            }
        }
        Ok(())
    })
}

/// Writes the empirical p-values next to the observed DSC values.
pub fn write_pvalues(
    path: &Path,
    gene_ids: &[String],
    summary: &PermutationSummary,
    saturate: bool,
) -> io::Result<()> {
    let mut formatter = ValueFormatter::new(saturate);
    write_atomically(path, |writer| {
        write!(writer, "#OVERALL\t{}", formatter.statistic(summary.observed_dsc))?;
        writeln!(writer, "\t{}", formatter.probability(summary.global_pvalue))?;
        writeln!(writer, "GENE\tDSC\tPVALUE")?;
        for (gene, id) in gene_ids.iter().enumerate() {
            write!(writer, "{id}\t{}", formatter.statistic(summary.gene_dsc[gene]))?;
            writeln!(writer, "\t{}", formatter.probability(summary.gene_pvalues[gene]))?;
        }
        Ok(())
    })
}
