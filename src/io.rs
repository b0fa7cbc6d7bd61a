use crate::error::{EngineError, Result};
use crate::job::TRAJECTORY_DIR;
use crate::store::{read_string, Store};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const TRAJECTORY_HEADER: &str = "t,x,y,z,value";

/// One grid cell of a tracer trajectory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryRow {
    pub t: usize,
    pub x: usize,
    pub y: usize,
    pub z: usize,
    pub value: f64,
}

impl TrajectoryRow {
    pub fn index(&self) -> [usize; 4] {
        [self.t, self.x, self.y, self.z]
    }
}

pub struct CsvWriter<W: Write> {
    w: BufWriter<W>,
}

impl CsvWriter<File> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        }
        let f = File::create(path).map_err(|e| EngineError::io(path, e))?;
        Ok(Self::new(f))
    }
}

impl<W: Write> CsvWriter<W> {
    pub fn new(w: W) -> Self {
        Self { w: BufWriter::new(w) }
    }

    pub fn write_header(&mut self, columns: &[&str]) -> Result<()> {
        writeln!(self.w, "{}", columns.join(",")).map_err(write_error)
    }

    pub fn write_trajectory_row(&mut self, row: &TrajectoryRow) -> Result<()> {
        writeln!(
            self.w,
            "{},{},{},{},{:e}",
            row.t, row.x, row.y, row.z, row.value
        )
        .map_err(write_error)
    }

    /// Value of `tracer` at a grid cell; land cells are skipped by the caller.
    pub fn write_value_row(&mut self, tracer: &str, index: &[usize], value: f64) -> Result<()> {
        let index: Vec<String> = index.iter().map(|i| i.to_string()).collect();
        writeln!(self.w, "{},{},{:.12e}", tracer, index.join(","), value).map_err(write_error)
    }

    pub fn write_derivative_row(
        &mut self,
        tracer: &str,
        parameter: usize,
        index: &[usize],
        value: f64,
    ) -> Result<()> {
        let index: Vec<String> = index.iter().map(|i| i.to_string()).collect();
        writeln!(
            self.w,
            "{},{},{},{:.12e}",
            tracer,
            parameter,
            index.join(","),
            value
        )
        .map_err(write_error)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.w.flush().map_err(write_error)
    }

    pub fn into_inner(self) -> Result<W> {
        self.w
            .into_inner()
            .map_err(|e| write_error(e.into_error()))
    }
}

fn write_error(e: std::io::Error) -> EngineError {
    EngineError::io("<csv output>", e)
}

/// File holding the trajectory of tracer `tracer` written by the run in `run`.
pub fn trajectory_file(run: &Path, tracer: usize) -> PathBuf {
    run.join(TRAJECTORY_DIR).join(format!("tracer_{}.csv", tracer))
}

pub fn write_trajectory(
    store: &dyn Store,
    run: &Path,
    tracer: usize,
    rows: impl IntoIterator<Item = TrajectoryRow>,
) -> Result<()> {
    let mut w = CsvWriter::new(Vec::new());
    w.write_header(&[TRAJECTORY_HEADER])?;
    for row in rows {
        w.write_trajectory_row(&row)?;
    }
    store.write(&trajectory_file(run, tracer), &w.into_inner()?)
}

pub fn read_trajectory(store: &dyn Store, run: &Path, tracer: usize) -> Result<Vec<TrajectoryRow>> {
    let path = trajectory_file(run, tracer);
    let text = read_string(store, &path)?
        .ok_or_else(|| EngineError::NotFound(format!("no trajectory file {}", path.display())))?;
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    match lines.next() {
        Some(header) if header.trim() == TRAJECTORY_HEADER => {}
        other => {
            return Err(EngineError::format(
                &path,
                format!("expected header '{}', found {:?}", TRAJECTORY_HEADER, other),
            ))
        }
    }
    lines
        .enumerate()
        .map(|(n, line)| parse_row(line).ok_or_else(|| EngineError::format(&path, format!("bad row {}: '{}'", n + 1, line))))
        .collect()
}

fn parse_row(line: &str) -> Option<TrajectoryRow> {
    let mut fields = line.split(',').map(str::trim);
    let mut index = || fields.next()?.parse::<usize>().ok();
    let (t, x, y, z) = (index()?, index()?, index()?, index()?);
    let value = fields.next()?.parse::<f64>().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(TrajectoryRow { t, x, y, z, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    #[test]
    fn test_trajectory_file_is_read_back() {
        let store = MemStore::new();
        let run = Path::new("trajectory/run_00");
        let rows = vec![
            TrajectoryRow { t: 0, x: 1, y: 2, z: 0, value: 2.5 },
            TrajectoryRow { t: 1, x: 1, y: 2, z: 0, value: -1.0e-7 },
        ];
        write_trajectory(&store, run, 1, rows.clone()).unwrap();
        assert_eq!(read_trajectory(&store, run, 1).unwrap(), rows);
        assert!(read_trajectory(&store, run, 0).unwrap_err().is_not_found());
    }

    #[test]
    fn test_malformed_trajectory_is_rejected() {
        let store = MemStore::new();
        let run = Path::new("run_00");
        store
            .write(&trajectory_file(run, 0), b"t,x,y,z,value\n0,1,2\n")
            .unwrap();
        assert!(matches!(
            read_trajectory(&store, run, 0),
            Err(EngineError::Format { .. })
        ));
        store.write(&trajectory_file(run, 0), b"a,b\n").unwrap();
        assert!(read_trajectory(&store, run, 0).is_err());
    }

    #[test]
    fn test_value_rows() {
        let mut w = CsvWriter::new(Vec::new());
        w.write_header(&["tracer", "t", "x", "y", "z", "value"]).unwrap();
        w.write_value_row("po4", &[0, 1, 2, 3], 1.5).unwrap();
        w.write_derivative_row("dop", 2, &[7], -0.25).unwrap();
        let text = String::from_utf8(w.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "tracer,t,x,y,z,value");
        assert_eq!(lines[1], "po4,0,1,2,3,1.500000000000e0");
        assert_eq!(lines[2], "dop,2,7,-2.500000000000e-1");
    }
}
