use super::mesh::{BoundarySide, Cell, Face, Mesh};

/// An axis-aligned structured grid. Axes with zero length are collapsed, so
/// the same description covers volumes, surfaces and lines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid {
    pub origin: [f64; 3],
    pub lengths: [f64; 3],
    pub divisions: [usize; 3],
}

/// Links one surface cell to the volume cell it sits on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FacePairing {
    pub surface_cell: usize,
    pub volume_cell: usize,
    pub area: f64,
}

impl Grid {
    pub fn new(origin: [f64; 3], lengths: [f64; 3], divisions: [usize; 3]) -> Self {
        let mut divisions = divisions;
        for a in 0..3 {
            divisions[a] = if lengths[a] > 0.0 { divisions[a].max(1) } else { 1 };
        }
        Self {
            origin,
            lengths,
            divisions,
        }
    }

    /// A box anchored at the origin.
    pub fn cuboid(lengths: [f64; 3], divisions: [usize; 3]) -> Self {
        Self::new([0.0; 3], lengths, divisions)
    }

    pub fn is_active(&self, axis: usize) -> bool {
        self.lengths[axis] > 0.0
    }

    pub fn dimension(&self) -> usize {
        (0..3).filter(|&a| self.is_active(a)).count()
    }

    pub fn spacing(&self) -> [f64; 3] {
        let mut h = [0.0; 3];
        for a in 0..3 {
            h[a] = self.lengths[a] / self.divisions[a] as f64;
        }
        h
    }

    pub fn num_cells(&self) -> usize {
        self.divisions.iter().product()
    }

    #[inline]
    pub fn cell_index(&self, idx: [usize; 3]) -> usize {
        idx[0] + self.divisions[0] * (idx[1] + self.divisions[1] * idx[2])
    }

    #[inline]
    fn cell_coords(&self, id: usize) -> [usize; 3] {
        let i = id % self.divisions[0];
        let j = (id / self.divisions[0]) % self.divisions[1];
        let k = id / (self.divisions[0] * self.divisions[1]);
        [i, j, k]
    }

    /// Measure of one cell over the active axes, optionally skipping one.
    fn measure(&self, skip: Option<usize>) -> f64 {
        let h = self.spacing();
        (0..3)
            .filter(|&a| self.is_active(a) && Some(a) != skip)
            .map(|a| h[a])
            .product()
    }
}

/// Build a finite-volume mesh on a structured grid.
pub fn structured_mesh(grid: &Grid) -> Mesh {
    let h = grid.spacing();
    let cell_volume = grid.measure(None);
    let n = grid.num_cells();

    let mut cells: Vec<Cell> = (0..n)
        .map(|id| {
            let idx = grid.cell_coords(id);
            let mut centroid = grid.origin;
            for a in 0..3 {
                if grid.is_active(a) {
                    centroid[a] += (idx[a] as f64 + 0.5) * h[a];
                }
            }
            Cell {
                id,
                volume: cell_volume,
                centroid,
                face_ids: Vec::new(),
            }
        })
        .collect();

    let mut faces = Vec::new();
    for axis in (0..3).filter(|&a| grid.is_active(a)) {
        let area = grid.measure(Some(axis));
        let mut normal = [0.0; 3];
        normal[axis] = 1.0;

        for id in 0..n {
            let idx = grid.cell_coords(id);
            let mut low_centroid = cells[id].centroid;
            low_centroid[axis] = grid.origin[axis] + idx[axis] as f64 * h[axis];

            if idx[axis] == 0 {
                let mut outward = [0.0; 3];
                outward[axis] = -1.0;
                push_face(
                    &mut faces,
                    &mut cells,
                    Face {
                        area,
                        normal: outward,
                        neighbor_cell_ids: (id, None),
                        centroid: low_centroid,
                        boundary: Some(BoundarySide::from_axis(axis, false)),
                    },
                );
            } else {
                let mut prev = idx;
                prev[axis] -= 1;
                let prev_id = grid.cell_index(prev);
                push_face(
                    &mut faces,
                    &mut cells,
                    Face {
                        area,
                        normal,
                        neighbor_cell_ids: (prev_id, Some(id)),
                        centroid: low_centroid,
                        boundary: None,
                    },
                );
            }

            if idx[axis] + 1 == grid.divisions[axis] {
                let mut high_centroid = cells[id].centroid;
                high_centroid[axis] = grid.origin[axis] + grid.lengths[axis];
                push_face(
                    &mut faces,
                    &mut cells,
                    Face {
                        area,
                        normal,
                        neighbor_cell_ids: (id, None),
                        centroid: high_centroid,
                        boundary: Some(BoundarySide::from_axis(axis, true)),
                    },
                );
            }
        }
    }

    Mesh {
        cells,
        faces,
        dimension: grid.dimension(),
    }
}

fn push_face(faces: &mut Vec<Face>, cells: &mut [Cell], face: Face) {
    let face_id = faces.len();
    let (k, l) = face.neighbor_cell_ids;
    cells[k].face_ids.push(face_id);
    if let Some(l) = l {
        cells[l].face_ids.push(face_id);
    }
    faces.push(face);
}

/// Extract the surface mesh lying on one side of a structured volume grid,
/// together with the surface-to-volume cell pairing.
///
/// Returns `None` when the side lies on a collapsed axis.
pub fn extract_surface(volume: &Grid, side: BoundarySide) -> Option<(Mesh, Vec<FacePairing>)> {
    let axis = side.axis();
    if !volume.is_active(axis) {
        return None;
    }

    let mut surface = *volume;
    if side.is_max() {
        surface.origin[axis] += volume.lengths[axis];
    }
    surface.lengths[axis] = 0.0;
    surface.divisions[axis] = 1;

    let mesh = structured_mesh(&surface);
    let layer = if side.is_max() {
        volume.divisions[axis] - 1
    } else {
        0
    };

    let pairings = (0..surface.num_cells())
        .map(|s| {
            let mut idx = surface.cell_coords(s);
            idx[axis] = layer;
            FacePairing {
                surface_cell: s,
                volume_cell: volume.cell_index(idx),
                area: mesh.cells[s].volume,
            }
        })
        .collect();

    Some((mesh, pairings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn box_mesh_measures_add_up() {
        let grid = Grid::cuboid([2.0, 1.0, 0.5], [4, 2, 1]);
        let mesh = structured_mesh(&grid);
        assert_eq!(mesh.num_cells(), 8);
        assert_eq!(mesh.dimension, 3);
        assert_relative_eq!(mesh.total_measure(), 1.0, epsilon = 1e-14);

        let xmax_area: f64 = mesh.boundary_faces(BoundarySide::XMax).map(|f| f.area).sum();
        assert_relative_eq!(xmax_area, 0.5, epsilon = 1e-14);
        // 3 x-faces per row * 2 rows + 4 y-faces
        assert_eq!(mesh.interior_faces().count(), 10);
    }

    #[test]
    fn surface_pairs_with_outer_layer() {
        let grid = Grid::cuboid([1.0, 1.0, 1.0], [3, 2, 2]);
        let (surface, pairs) = extract_surface(&grid, BoundarySide::XMax).unwrap();
        assert_eq!(surface.dimension, 2);
        assert_eq!(surface.num_cells(), 4);
        assert_relative_eq!(surface.total_measure(), 1.0, epsilon = 1e-14);
        for p in &pairs {
            assert_eq!(p.volume_cell % 3, 2);
        }
        let volume = structured_mesh(&grid);
        let cell = &volume.cells[pairs[0].volume_cell];
        assert_relative_eq!(cell.centroid[0], 5.0 / 6.0, epsilon = 1e-14);
    }

    #[test]
    fn collapsed_side_has_no_surface() {
        let grid = Grid::cuboid([1.0, 1.0, 0.0], [2, 2, 5]);
        assert_eq!(grid.divisions[2], 1);
        assert!(extract_surface(&grid, BoundarySide::ZMin).is_none());
    }
}
