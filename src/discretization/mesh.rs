/// Axis-aligned boundary side of a structured mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoundarySide {
    XMin,
    XMax,
    YMin,
    YMax,
    ZMin,
    ZMax,
}

impl BoundarySide {
    pub fn axis(&self) -> usize {
        match self {
            BoundarySide::XMin | BoundarySide::XMax => 0,
            BoundarySide::YMin | BoundarySide::YMax => 1,
            BoundarySide::ZMin | BoundarySide::ZMax => 2,
        }
    }

    pub fn is_max(&self) -> bool {
        matches!(
            self,
            BoundarySide::XMax | BoundarySide::YMax | BoundarySide::ZMax
        )
    }

    pub fn from_axis(axis: usize, max: bool) -> Self {
        match (axis, max) {
            (0, false) => BoundarySide::XMin,
            (0, true) => BoundarySide::XMax,
            (1, false) => BoundarySide::YMin,
            (1, true) => BoundarySide::YMax,
            (_, false) => BoundarySide::ZMin,
            (_, true) => BoundarySide::ZMax,
        }
    }
}

/// The complete computational grid of one domain.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub cells: Vec<Cell>,
    pub faces: Vec<Face>,
    /// Topological dimension: 3 for volumes, 2 for surfaces.
    pub dimension: usize,
}

/// A single control volume. `volume` is the cell measure in the mesh's own
/// dimension (an area for surface meshes).
#[derive(Debug, Clone)]
pub struct Cell {
    pub id: usize,
    pub volume: f64,
    pub centroid: [f64; 3],
    pub face_ids: Vec<usize>,
}

/// An interface between two cells.
#[derive(Debug, Clone)]
pub struct Face {
    /// Face measure (an edge length for surface meshes).
    pub area: f64,
    pub normal: [f64; 3],
    /// Tuple of (cell1_id, optional cell2_id). `None` indicates a boundary face.
    pub neighbor_cell_ids: (usize, Option<usize>),
    pub centroid: [f64; 3],
    pub boundary: Option<BoundarySide>,
}

impl Mesh {
    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    /// Sum of all cell measures.
    pub fn total_measure(&self) -> f64 {
        self.cells.iter().map(|c| c.volume).sum()
    }

    pub fn boundary_faces(&self, side: BoundarySide) -> impl Iterator<Item = &Face> {
        self.faces
            .iter()
            .filter(move |f| f.boundary == Some(side))
    }

    pub fn interior_faces(&self) -> impl Iterator<Item = (&Face, usize, usize)> {
        self.faces.iter().filter_map(|f| match f.neighbor_cell_ids {
            (k, Some(l)) => Some((f, k, l)),
            _ => None,
        })
    }

    /// Centroid distance between two cells.
    #[inline]
    pub fn cell_distance(&self, k: usize, l: usize) -> f64 {
        let (a, b) = (self.cells[k].centroid, self.cells[l].centroid);
        (0..3).map(|i| (b[i] - a[i]).powi(2)).sum::<f64>().sqrt()
    }
}
