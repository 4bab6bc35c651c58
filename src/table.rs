//! Row-major tabular values with CSV reading and writing.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    Int(i64),
    Float(f64),
    Text(String),
    Missing,
}

impl Cell {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(_) | Self::Missing => None,
        }
    }

    pub fn parse_field(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::Missing;
        }
        if let Ok(v) = trimmed.parse::<i64>() {
            return Self::Int(v);
        }
        if let Ok(v) = trimmed.parse::<f64>() {
            return Self::Float(v);
        }
        Self::Text(raw.to_string())
    }

    pub fn to_field(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Text(v) => v.clone(),
            Self::Missing => String::new(),
        }
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("row {row} has {found} cells, expected {expected}")]
    RowWidth {
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error("duplicate column name: {0}")]
    DuplicateColumn(String),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Result<Self, TableError> {
        for (idx, name) in columns.iter().enumerate() {
            if columns[..idx].contains(name) {
                return Err(TableError::DuplicateColumn(name.clone()));
            }
        }
        Ok(Self {
            columns,
            rows: Vec::new(),
        })
    }

    pub fn with_rows(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Result<Self, TableError> {
        let mut table = Self::new(columns)?;
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    pub(crate) fn from_parts(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        debug_assert!(rows.iter().all(|row| row.len() == columns.len()));
        Self { columns, rows }
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<(), TableError> {
        if row.len() != self.columns.len() {
            return Err(TableError::RowWidth {
                row: self.rows.len(),
                found: row.len(),
                expected: self.columns.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&Cell> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    pub fn numeric_column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.column_index(name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row[idx].as_f64().unwrap_or(f64::NAN))
                .collect(),
        )
    }

    pub(crate) fn column_cells(&self, idx: usize) -> impl Iterator<Item = &Cell> + '_ {
        self.rows.iter().map(move |row| &row[idx])
    }

    pub(crate) fn replace_column(&mut self, idx: usize, values: Vec<Cell>) {
        for (row, value) in self.rows.iter_mut().zip(values) {
            row[idx] = value;
        }
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, TableError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(reader);
        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut table = Self::new(columns)?;
        for record in reader.records() {
            let record = record?;
            table.push_row(record.iter().map(Cell::parse_field).collect())?;
        }
        Ok(table)
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), TableError> {
        let mut writer = csv::Writer::from_writer(writer);
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row.iter().map(Cell::to_field))?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_csv_path(path: &Path) -> Result<Self, TableError> {
        Self::from_csv_reader(File::open(path)?)
    }

    pub fn write_csv_path(&self, path: &Path) -> Result<(), TableError> {
        self.write_csv(File::create(path)?)
    }
}
