//! Map cloud and trajectory files.
//!
//! `map.csv` rows are `x, y, z[, nx, ny, nz]`. Missing or `nan` normals are
//! kept as NaN so points and normals stay index-aligned.

use std::path::Path;

use anyhow::{Context, Result, bail};
use csv::{ReaderBuilder, WriterBuilder};
use nalgebra::Vector3;

use crate::map::cloud::{NormalCloud, PointCloud};

pub fn load_map_csv<P: AsRef<Path>>(path: P) -> Result<(PointCloud, NormalCloud)> {
    let path = path.as_ref();
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut cloud = PointCloud::new();
    let mut normals = NormalCloud::new();
    for (row, rec) in rdr.records().enumerate() {
        let rec = rec.with_context(|| format!("{}: bad record {}", path.display(), row + 1))?;
        if rec.len() < 3 {
            bail!(
                "{}: row {} has {} fields, expected at least 3",
                path.display(),
                row + 1,
                rec.len()
            );
        }
        let field = |i: usize| -> Result<f64> {
            rec[i]
                .trim()
                .parse::<f64>()
                .with_context(|| format!("{}: row {}, column {}", path.display(), row + 1, i + 1))
        };

        cloud.push(Vector3::new(field(0)?, field(1)?, field(2)?));
        let normal = if rec.len() >= 6 {
            Vector3::new(field(3)?, field(4)?, field(5)?)
        } else {
            Vector3::repeat(f64::NAN)
        };
        normals.push(normal);
    }
    Ok((cloud, normals))
}

/// Writes `frame, x, y, z` rows.
pub fn write_trajectory_csv<P: AsRef<Path>>(path: P, positions: &[Vector3<f64>]) -> Result<()> {
    let path = path.as_ref();
    let mut wtr = WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    for (i, p) in positions.iter().enumerate() {
        wtr.write_record(&[
            i.to_string(),
            p.x.to_string(),
            p.y.to_string(),
            p.z.to_string(),
        ])?;
    }
    wtr.flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
