use crate::types::GridPoint;
use geo::{BoundingRect, Intersects, MultiPolygon, Point, Polygon, Rect};
use rstar::{RTree, RTreeObject, AABB};

/// Polygon wrapper so boundary parts can live in an R-tree.
pub struct BoundaryPolygon(Polygon<f64>);

impl RTreeObject for BoundaryPolygon {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        match self.0.bounding_rect() {
            Some(bbox) => AABB::from_corners([bbox.min().x, bbox.min().y], [bbox.max().x, bbox.max().y]),
            None => AABB::from_point([f64::NAN, f64::NAN]),
        }
    }
}

/// The national outline as the union of its parts, indexed for point queries.
pub struct Boundary {
    tree: RTree<BoundaryPolygon>,
    bbox: Option<Rect<f64>>,
}

impl Boundary {
    pub fn new(parts: &[MultiPolygon<f64>]) -> Self {
        let polygons: Vec<BoundaryPolygon> = parts
            .iter()
            .flat_map(|mp| mp.0.iter().cloned())
            .filter(|p| p.bounding_rect().is_some())
            .map(BoundaryPolygon)
            .collect();
        let bbox = polygons
            .iter()
            .filter_map(|p| p.0.bounding_rect())
            .reduce(|a, b| {
                Rect::new(
                    (a.min().x.min(b.min().x), a.min().y.min(b.min().y)),
                    (a.max().x.max(b.max().x), a.max().y.max(b.max().y)),
                )
            });
        Self {
            tree: RTree::bulk_load(polygons),
            bbox,
        }
    }

    pub fn bounding_rect(&self) -> Option<Rect<f64>> {
        self.bbox
    }

    /// Inside or on the edge of any part.
    pub fn covers(&self, point: &Point<f64>) -> bool {
        let envelope = AABB::from_point([point.x(), point.y()]);
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .any(|part| part.0.intersects(point))
    }
}

/// Cell centres of an `nx` × `ny` lattice over the boundary's bounding rectangle.
pub fn lattice(bbox: Rect<f64>, (nx, ny): (usize, usize)) -> Vec<Point<f64>> {
    let dx = bbox.width() / nx as f64;
    let dy = bbox.height() / ny as f64;
    (0..ny)
        .flat_map(|j| {
            (0..nx).map(move |i| {
                Point::new(
                    bbox.min().x + (i as f64 + 0.5) * dx,
                    bbox.min().y + (j as f64 + 0.5) * dy,
                )
            })
        })
        .collect()
}

/// Lattice points that fall within the boundary, in row-major order.
pub fn clipped_grid(boundary: &Boundary, resolution: (usize, usize)) -> Vec<GridPoint> {
    let Some(bbox) = boundary.bounding_rect() else {
        return Vec::new();
    };
    let grid: Vec<GridPoint> = lattice(bbox, resolution)
        .into_iter()
        .filter(|p| boundary.covers(p))
        .map(|point| GridPoint { point })
        .collect();
    tracing::info!(
        "Grid keeps {} of {} lattice points",
        grid.len(),
        resolution.0 * resolution.1
    );
    grid
}

/// Size of one lattice cell, used to draw raster cells.
pub fn cell_size(bbox: Rect<f64>, (nx, ny): (usize, usize)) -> (f64, f64) {
    (bbox.width() / nx as f64, bbox.height() / ny as f64)
}
