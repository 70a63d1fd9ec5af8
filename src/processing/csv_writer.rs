use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::model::domain::DomainId;
use crate::model::Model;
use crate::numerics::state::SolutionState;

/// Write data to CSV file with headers
pub fn write_csv<P: AsRef<Path>>(path: P, headers: &[&str], data: &[Vec<f64>]) -> io::Result<()> {
    if !headers.is_empty() && !data.is_empty() && headers.len() != data.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "Headers count ({}) doesn't match data columns ({})",
                headers.len(),
                data.len()
            ),
        ));
    }

    let mut file = File::create(path)?;

    writeln!(file, "{}", headers.join(","))?;

    let n_rows = data.iter().map(|col| col.len()).max().unwrap_or(0);

    for i in 0..n_rows {
        let row: Vec<String> = data
            .iter()
            .map(|col| {
                if i < col.len() {
                    format!("{:.15e}", col[i])
                } else {
                    String::new()
                }
            })
            .collect();
        writeln!(file, "{}", row.join(","))?;
    }

    Ok(())
}

/// Write the current field of one domain: cell centroids followed by one
/// column per species.
pub fn write_domain_field<P: AsRef<Path>>(
    path: P,
    model: &Model,
    state: &SolutionState,
    domain: DomainId,
) -> io::Result<()> {
    let d = model.domain(domain);
    let block = model.registry.block_of(domain).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("domain '{}' owns no unknowns", d.name),
        )
    })?;
    let u = state.u(block);
    let m = d.num_species();

    let mut headers = vec!["x", "y", "z"];
    headers.extend(d.species.iter().map(|s| s.name.as_str()));

    let mut columns: Vec<Vec<f64>> = (0..3)
        .map(|axis| d.mesh.cells.iter().map(|c| c.centroid[axis]).collect())
        .collect();
    for s in 0..m {
        columns.push(d.mesh.cells.iter().map(|c| u[c.id * m + s]).collect());
    }
    write_csv(path, &headers, &columns)
}
