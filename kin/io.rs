//! # Rate tables in, result tables out
//!
//! Rate files are tab-separated with a header row and one row per
//! `(year, age, stage)` cell:
//!
//! - rates: `age`, `survival`, `fertility`, optional `year`, `stage` (1-based)
//!   and `population`;
//! - stage transitions: `age`, `from_stage`, `to_stage`, `probability`,
//!   optional `year`; cells not listed are zero;
//! - cause hazards: `age`, `cause`, `hazard`, optional `year`; cells not
//!   listed are zero.
//!
//! Tables without a `year` column apply to every period. Results are written
//! as tab-separated files with `NA` for undefined values.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use ndarray::{Array1, Array2};
use polars::prelude::*;
use thiserror::Error;

use crate::engine::KinshipOutput;
use crate::rates::{CauseHazards, RateInput, VitalRates};
use crate::summary::{FullRow, SummaryRow};

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Error writing results: {0}")]
    CsvError(#[from] csv::Error),
    #[error("The required column '{column}' was not found in '{}'.", file.display())]
    ColumnNotFound { column: String, file: PathBuf },
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing or null values were found in the column '{0}'.")]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in the column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("The column '{column}' must hold non-negative whole numbers, found {value}.")]
    NotAnIndex { column: String, value: f64 },
    #[error("'{}' contains no data rows.", .0.display())]
    EmptyTable(PathBuf),
    #[error("Duplicate row for year {year:?}, age {age}, stage {stage} in '{}'.", file.display())]
    DuplicateRow {
        file: PathBuf,
        year: Option<i32>,
        age: usize,
        stage: usize,
    },
    #[error("No rates for year {year:?}, age {age}, stage {stage}; every cell of the age grid is required.")]
    MissingCell {
        year: Option<i32>,
        age: usize,
        stage: usize,
    },
    #[error("Rate years must be consecutive, but {previous} is followed by {next}.")]
    YearGap { previous: i32, next: i32 },
    #[error("'{}' has rows for year {year}, which the rates file does not cover.", file.display())]
    UnmatchedYear { file: PathBuf, year: i32 },
    #[error("'{}' has no rows for year {year}, which the rates file covers.", file.display())]
    MissingYear { file: PathBuf, year: i32 },
    #[error("'{}' is given per year but the rates are constant.", .0.display())]
    UnexpectedYears(PathBuf),
    #[error("'{}' refers to {found}, outside the rate grid of {ages} ages and {stages} stages.", file.display())]
    OutsideGrid {
        file: PathBuf,
        found: String,
        ages: usize,
        stages: usize,
    },
}

/// The files describing one sex's rates.
#[derive(Debug, Clone, Copy)]
pub struct RateFiles<'a> {
    pub rates: &'a Path,
    pub transitions: Option<&'a Path>,
    pub causes: Option<&'a Path>,
}

/// Reads one sex's rates and attaches optional transitions, causes and the
/// birth-stage matrix to every period.
pub fn load_rate_input(
    files: RateFiles<'_>,
    birth_stages: Option<&Array2<f64>>,
) -> Result<RateInput, DataError> {
    let mut table = read_rates(files.rates)?;
    if let Some(path) = files.transitions {
        let transitions = read_transitions(path, &table)?;
        for (year, rates) in table.entries_mut() {
            let matrices = transitions.for_year(year);
            rates.stage_transitions = matrices.cloned();
        }
    }
    if let Some(path) = files.causes {
        let causes = read_causes(path, &table)?;
        for (year, rates) in table.entries_mut() {
            rates.causes = causes.for_year(year).cloned();
        }
    }
    if let Some(birth_stages) = birth_stages {
        for (_, rates) in table.entries_mut() {
            rates.birth_stages = Some(birth_stages.clone());
        }
    }
    Ok(table.into_input())
}

/// Parsed rates before conversion into a [`RateInput`].
struct RateTable {
    first_year: Option<i32>,
    ages: usize,
    stages: usize,
    periods: Vec<VitalRates>,
}

impl RateTable {
    fn years(&self) -> Vec<Option<i32>> {
        match self.first_year {
            Some(first) => (0..self.periods.len())
                .map(|offset| Some(first + offset as i32))
                .collect(),
            None => vec![None],
        }
    }

    fn entries_mut(&mut self) -> impl Iterator<Item = (Option<i32>, &mut VitalRates)> {
        self.years().into_iter().zip(self.periods.iter_mut())
    }

    fn into_input(self) -> RateInput {
        match self.first_year {
            Some(first_year) => RateInput::Periods {
                first_year,
                periods: self.periods,
            },
            None => {
                let mut periods = self.periods;
                RateInput::Constant(periods.remove(0))
            }
        }
    }
}

/// Per-year values of an auxiliary table, or one value for every year.
enum ByYear<T> {
    Constant(T),
    Years(BTreeMap<i32, T>),
}

impl<T> ByYear<T> {
    fn for_year(&self, year: Option<i32>) -> Option<&T> {
        match (self, year) {
            (Self::Constant(value), _) => Some(value),
            (Self::Years(map), Some(year)) => map.get(&year),
            (Self::Years(_), None) => None,
        }
    }
}

fn read_table(path: &Path) -> Result<DataFrame, DataError> {
    log::debug!("Loading table from '{}'", path.display());
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;
    if df.height() == 0 {
        return Err(DataError::EmptyTable(path.to_path_buf()));
    }
    Ok(df)
}

fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_names().iter().any(|c| c.as_str() == name)
}

fn require_columns(df: &DataFrame, path: &Path, names: &[&str]) -> Result<(), DataError> {
    let present: HashSet<String> = df.get_column_names().iter().map(|c| c.to_string()).collect();
    match names.iter().find(|name| !present.contains(**name)) {
        Some(missing) => Err(DataError::ColumnNotFound {
            column: missing.to_string(),
            file: path.to_path_buf(),
        }),
        None => Ok(()),
    }
}

fn numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(column_name.to_string()));
    }
    let casted = match series.cast(&DataType::Float64) {
        Ok(casted) => casted,
        Err(_) => {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64",
                found_type: format!("{:?}", series.dtype()),
            });
        }
    };
    if casted.null_count() > 0 {
        return Err(DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64",
            found_type: format!("{:?}", series.dtype()),
        });
    }
    let chunked = casted.f64()?.rechunk();
    let values: Vec<f64> = chunked.into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok(values)
}

fn index_column(df: &DataFrame, column_name: &str) -> Result<Vec<usize>, DataError> {
    numeric_column(df, column_name)?
        .into_iter()
        .map(|value| {
            if value >= 0.0 && value.fract() == 0.0 {
                Ok(value as usize)
            } else {
                Err(DataError::NotAnIndex {
                    column: column_name.to_string(),
                    value,
                })
            }
        })
        .collect()
}

/// 1-based stage column turned into 0-based indices; all zero when absent.
fn stage_column(df: &DataFrame, column_name: &str) -> Result<Vec<usize>, DataError> {
    if !has_column(df, column_name) {
        return Ok(vec![0; df.height()]);
    }
    index_column(df, column_name)?
        .into_iter()
        .map(|stage| {
            stage.checked_sub(1).ok_or(DataError::NotAnIndex {
                column: column_name.to_string(),
                value: 0.0,
            })
        })
        .collect()
}

fn year_column(df: &DataFrame) -> Result<Option<Vec<i32>>, DataError> {
    if !has_column(df, "year") {
        return Ok(None);
    }
    let years = numeric_column(df, "year")?
        .into_iter()
        .map(|value| {
            if value.fract() == 0.0 && value.abs() < i32::MAX as f64 {
                Ok(value as i32)
            } else {
                Err(DataError::NotAnIndex {
                    column: "year".to_string(),
                    value,
                })
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(years))
}

fn string_column(df: &DataFrame, column_name: &str) -> Result<Vec<String>, DataError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(column_name.to_string()));
    }
    let casted = series.cast(&DataType::String)?;
    let values = casted
        .str()?
        .into_iter()
        .map(|value| value.unwrap_or_default().trim().to_string())
        .collect();
    Ok(values)
}

fn read_rates(path: &Path) -> Result<RateTable, DataError> {
    let df = read_table(path)?;
    require_columns(&df, path, &["age", "survival", "fertility"])?;
    let ages = index_column(&df, "age")?;
    let stages = stage_column(&df, "stage")?;
    let survival = numeric_column(&df, "survival")?;
    let fertility = numeric_column(&df, "fertility")?;
    let population = if has_column(&df, "population") {
        Some(numeric_column(&df, "population")?)
    } else {
        None
    };
    let years = year_column(&df)?;

    let age_count = ages.iter().max().map_or(0, |&age| age + 1);
    let stage_count = stages.iter().max().map_or(0, |&stage| stage + 1);

    let mut cells: BTreeMap<Option<i32>, BTreeMap<(usize, usize), (f64, f64, f64)>> =
        BTreeMap::new();
    for row in 0..df.height() {
        let year = years.as_ref().map(|years| years[row]);
        let key = (ages[row], stages[row]);
        let value = (
            survival[row],
            fertility[row],
            population.as_ref().map_or(0.0, |p| p[row]),
        );
        if cells.entry(year).or_default().insert(key, value).is_some() {
            return Err(DataError::DuplicateRow {
                file: path.to_path_buf(),
                year,
                age: key.0,
                stage: key.1,
            });
        }
    }

    if let Some((previous, next)) = cells
        .keys()
        .flatten()
        .tuple_windows()
        .find(|&(previous, next)| next - previous != 1)
    {
        return Err(DataError::YearGap {
            previous: *previous,
            next: *next,
        });
    }

    let mut periods = Vec::with_capacity(cells.len());
    for (&year, grid) in &cells {
        let mut survival = Array2::zeros((age_count, stage_count));
        let mut fertility = Array2::zeros((age_count, stage_count));
        let mut counts = Array2::zeros((age_count, stage_count));
        for age in 0..age_count {
            for stage in 0..stage_count {
                let &(s, f, n) = grid
                    .get(&(age, stage))
                    .ok_or(DataError::MissingCell { year, age, stage })?;
                survival[[age, stage]] = s;
                fertility[[age, stage]] = f;
                counts[[age, stage]] = n;
            }
        }
        periods.push(VitalRates {
            survival,
            fertility,
            stage_transitions: None,
            birth_stages: None,
            causes: None,
            population: population.is_some().then_some(counts),
        });
    }
    let first_year = cells.keys().next().copied().flatten();
    log::info!(
        "Loaded {} period(s) of rates over {age_count} ages and {stage_count} stage(s) from '{}'",
        periods.len(),
        path.display()
    );
    Ok(RateTable {
        first_year,
        ages: age_count,
        stages: stage_count,
        periods,
    })
}

/// Checks that an auxiliary table given per year lists exactly the years of
/// the rates.
fn check_years(path: &Path, table: &RateTable, years: &Option<Vec<i32>>) -> Result<(), DataError> {
    let Some(years) = years else {
        return Ok(());
    };
    let covered: Vec<i32> = table.years().into_iter().flatten().collect();
    if covered.is_empty() {
        return Err(DataError::UnexpectedYears(path.to_path_buf()));
    }
    if let Some(&year) = years.iter().find(|year| !covered.contains(year)) {
        return Err(DataError::UnmatchedYear {
            file: path.to_path_buf(),
            year,
        });
    }
    let listed: HashSet<i32> = years.iter().copied().collect();
    match covered.into_iter().find(|year| !listed.contains(year)) {
        Some(year) => Err(DataError::MissingYear {
            file: path.to_path_buf(),
            year,
        }),
        None => Ok(()),
    }
}

fn group_by_year<T>(
    years: Option<Vec<i32>>,
    rows: usize,
    mut build: impl FnMut(&[usize]) -> Result<T, DataError>,
) -> Result<ByYear<T>, DataError> {
    match years {
        None => Ok(ByYear::Constant(build(&(0..rows).collect::<Vec<_>>())?)),
        Some(years) => {
            let groups = (0..rows).into_group_map_by(|&row| years[row]);
            let mut map = BTreeMap::new();
            for (year, rows) in groups {
                map.insert(year, build(&rows)?);
            }
            Ok(ByYear::Years(map))
        }
    }
}

fn read_transitions(path: &Path, table: &RateTable) -> Result<ByYear<Vec<Array2<f64>>>, DataError> {
    let df = read_table(path)?;
    require_columns(&df, path, &["age", "from_stage", "to_stage", "probability"])?;
    let ages = index_column(&df, "age")?;
    let from = stage_column(&df, "from_stage")?;
    let to = stage_column(&df, "to_stage")?;
    let probability = numeric_column(&df, "probability")?;
    let years = year_column(&df)?;
    check_years(path, table, &years)?;

    let (age_count, stage_count) = (table.ages, table.stages);
    group_by_year(years, df.height(), |rows| {
        let mut blocks = vec![Array2::zeros((stage_count, stage_count)); age_count];
        for &row in rows {
            let (age, from, to) = (ages[row], from[row], to[row]);
            if age >= age_count || from >= stage_count || to >= stage_count {
                return Err(DataError::OutsideGrid {
                    file: path.to_path_buf(),
                    found: format!("age {age}, stages {} -> {}", from + 1, to + 1),
                    ages: age_count,
                    stages: stage_count,
                });
            }
            blocks[age][[to, from]] += probability[row];
        }
        Ok(blocks)
    })
}

fn read_causes(path: &Path, table: &RateTable) -> Result<ByYear<CauseHazards>, DataError> {
    let df = read_table(path)?;
    require_columns(&df, path, &["age", "cause", "hazard"])?;
    let ages = index_column(&df, "age")?;
    let causes = string_column(&df, "cause")?;
    let hazard = numeric_column(&df, "hazard")?;
    let years = year_column(&df)?;
    check_years(path, table, &years)?;

    let names: Vec<String> = causes.iter().cloned().sorted().dedup().collect();
    let age_count = table.ages;
    group_by_year(years, df.height(), |rows| {
        let mut hazards = Array2::zeros((names.len(), age_count));
        for &row in rows {
            let age = ages[row];
            if age >= age_count {
                return Err(DataError::OutsideGrid {
                    file: path.to_path_buf(),
                    found: format!("age {age}"),
                    ages: age_count,
                    stages: table.stages,
                });
            }
            let cause = names
                .binary_search(&causes[row])
                .unwrap_or_else(|position| position);
            hazards[[cause, age]] += hazard[row];
        }
        Ok(CauseHazards {
            names: names.clone(),
            hazards,
        })
    })
}

/// Parses a `[stages][stages]` birth-stage matrix given row by row.
pub fn birth_stage_matrix(rows: &[Vec<f64>]) -> Option<Array2<f64>> {
    let width = rows.first()?.len();
    if rows.iter().any(|row| row.len() != width) {
        return None;
    }
    let flat: Array1<f64> = rows.iter().flatten().copied().collect();
    flat.into_shape_with_order((rows.len(), width)).ok()
}

fn optional(value: Option<f64>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| v.to_string())
}

fn optional_index<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| v.to_string())
}

fn writer(path: &Path) -> Result<csv::Writer<File>, DataError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?)
}

pub fn write_summary(path: &Path, output: &KinshipOutput) -> Result<(), DataError> {
    let mut out = writer(path)?;
    let mut header = vec![
        "kin".to_string(),
        "focal_age".into(),
        "sex".into(),
        "year".into(),
        "cohort".into(),
        "count_living".into(),
        "mean_age".into(),
        "sd_age".into(),
        "count_dead".into(),
        "count_cum_dead".into(),
        "mean_age_at_death".into(),
    ];
    header.extend(output.cause_names.iter().map(|name| format!("cum_dead_{name}")));
    out.write_record(&header)?;
    for row in &output.summary {
        out.write_record(summary_record(row))?;
    }
    out.flush()?;
    log::info!("Wrote {} summary rows to '{}'", output.summary.len(), path.display());
    Ok(())
}

fn summary_record(row: &SummaryRow) -> Vec<String> {
    let mut record = vec![
        row.kin.code().to_string(),
        row.focal_age.to_string(),
        optional_index(row.sex.map(|sex| sex.code())),
        optional_index(row.year),
        optional_index(row.cohort),
        row.count_living.to_string(),
        optional(row.mean_age),
        optional(row.sd_age),
        row.count_dead.to_string(),
        row.count_cum_dead.to_string(),
        optional(row.mean_age_at_death),
    ];
    record.extend(row.cum_dead_by_cause.iter().map(f64::to_string));
    record
}

pub fn write_full(path: &Path, rows: &[FullRow]) -> Result<(), DataError> {
    let mut out = writer(path)?;
    out.write_record([
        "kin", "focal_age", "kin_age", "stage", "sex", "year", "cohort", "living", "dead",
        "cum_dead",
    ])?;
    for row in rows {
        out.write_record([
            row.kin.code().to_string(),
            row.focal_age.to_string(),
            row.kin_age.to_string(),
            optional_index(row.stage),
            optional_index(row.sex.map(|sex| sex.code())),
            optional_index(row.year),
            optional_index(row.cohort),
            row.living.to_string(),
            row.dead.to_string(),
            row.cum_dead.to_string(),
        ])?;
    }
    out.flush()?;
    log::info!("Wrote {} full rows to '{}'", rows.len(), path.display());
    Ok(())
}
