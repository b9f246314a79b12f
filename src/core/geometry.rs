//! Axis-aligned page-space geometry and the overlap heuristic that decides
//! whether two painted rasters are tiles of the same figure.

/// Point in PDF user space.
#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) struct Point {
  pub x: f64,
  pub y: f64,
}

impl Point {
  pub fn new(x: f64, y: f64) -> Self {
    Point { x, y }
  }

  pub fn distance_to(&self, other: Point) -> f64 {
    ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
  }

  /// Euclidean distance to the nearest point of `rect`; zero inside.
  pub fn distance_to_rect(&self, rect: &Rect) -> f64 {
    let dx = (rect.x0 - self.x).max(0.0).max(self.x - rect.x1);
    let dy = (rect.y0 - self.y).max(0.0).max(self.y - rect.y1);
    (dx * dx + dy * dy).sqrt()
  }
}

/// Axis-aligned rectangle with `x0 <= x1`, `y0 <= y1`, top-left origin.
#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) struct Rect {
  pub x0: f64,
  pub y0: f64,
  pub x1: f64,
  pub y1: f64,
}

impl Rect {
  pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
    Rect {
      x0: x0.min(x1),
      y0: y0.min(y1),
      x1: x0.max(x1),
      y1: y0.max(y1),
    }
  }

  pub fn width(&self) -> f64 {
    self.x1 - self.x0
  }

  pub fn height(&self) -> f64 {
    self.y1 - self.y0
  }

  pub fn contains(&self, other: &Rect) -> bool {
    self.x0 <= other.x0 && self.y0 <= other.y0 && self.x1 >= other.x1 && self.y1 >= other.y1
  }

  /// Grow in place to the minimum bounding rectangle of `self` and `other`.
  pub fn include(&mut self, other: &Rect) {
    self.x0 = self.x0.min(other.x0);
    self.y0 = self.y0.min(other.y0);
    self.x1 = self.x1.max(other.x1);
    self.y1 = self.y1.max(other.y1);
  }

  /// Corners in the fixed order top-left, top-right, bottom-left,
  /// bottom-right. The overlap rules below index into this order.
  pub fn corners(&self) -> [Point; 4] {
    [
      Point::new(self.x0, self.y0),
      Point::new(self.x1, self.y0),
      Point::new(self.x0, self.y1),
      Point::new(self.x1, self.y1),
    ]
  }
}

/// 2D affine transform in PDF row-vector convention
/// (`x' = a·x + c·y + e`, `y' = b·x + d·y + f`).
#[derive(Clone, Copy, Debug)]
pub(crate) struct Matrix {
  pub a: f64,
  pub b: f64,
  pub c: f64,
  pub d: f64,
  pub e: f64,
  pub f: f64,
}

impl Matrix {
  pub fn new(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Self {
    Matrix { a, b, c, d, e, f }
  }

  pub fn identity() -> Self {
    Matrix::new(1.0, 0.0, 0.0, 1.0, 0.0, 0.0)
  }

  pub fn transform(&self, p: Point) -> Point {
    Point::new(
      self.a * p.x + self.c * p.y + self.e,
      self.b * p.x + self.d * p.y + self.f,
    )
  }

  /// `self` applied first, then `after` (content-stream `cm` semantics:
  /// the new matrix pre-concatenates onto the current CTM).
  pub fn then(&self, after: &Matrix) -> Matrix {
    Matrix::new(
      self.a * after.a + self.b * after.c,
      self.a * after.b + self.b * after.d,
      self.c * after.a + self.d * after.c,
      self.c * after.b + self.d * after.d,
      self.e * after.a + self.f * after.c + after.e,
      self.e * after.b + self.f * after.d + after.f,
    )
  }
}

/// Decide whether two rectangles belong to the same figure.
///
/// Deliberately looser than geometric intersection: tiles of one figure
/// frequently abut without touching, so near-adjacency within `distance`
/// counts. Exact same-location rectangles return `false` — those are
/// duplicates, handled by the post-processor, not figure parts.
pub(crate) fn check_overlap(a: &Rect, b: &Rect, distance: f64, distance_bbox: f64) -> bool {
  let [p0, p1, p2, p3] = a.corners();
  let [q0, q1, q2, q3] = b.corners();

  if p0.distance_to(q0) == 0.0
    && p1.distance_to(q1) == 0.0
    && p2.distance_to(q2) == 0.0
    && p3.distance_to(q3) == 0.0
  {
    return false;
  }

  if b.contains(a) || a.contains(b) {
    return true;
  }

  // Edge adjacency: a left of b, a right of b, a above b, a below b.
  if p1.distance_to(q0) < distance && p3.distance_to(q2) < distance {
    return true;
  }
  if p0.distance_to(q1) < distance && p2.distance_to(q3) < distance {
    return true;
  }
  if p0.distance_to(q2) < distance && p1.distance_to(q3) < distance {
    return true;
  }
  if p2.distance_to(q0) < distance && p3.distance_to(q1) < distance {
    return true;
  }

  // Corner-on-edge proximity: two corners of `a` touching `b`, with at
  // least one of them sitting on the matching corner of `b`. This is the
  // rule that separates stacked tiles of one figure from unrelated
  // neighbours that merely share an edge region.
  if p1.distance_to_rect(b) < distance_bbox
    && p3.distance_to_rect(b) < distance_bbox
    && (p1.distance_to(q0) < distance_bbox || p3.distance_to(q2) < distance_bbox)
  {
    return true;
  }
  if p0.distance_to_rect(b) < distance_bbox
    && p2.distance_to_rect(b) < distance_bbox
    && (p0.distance_to(q1) < distance_bbox || p2.distance_to(q3) < distance_bbox)
  {
    return true;
  }
  if p0.distance_to_rect(b) < distance_bbox
    && p1.distance_to_rect(b) < distance_bbox
    && (p0.distance_to(q2) < distance_bbox || p1.distance_to(q3) < distance_bbox)
  {
    return true;
  }
  if p2.distance_to_rect(b) < distance_bbox
    && p3.distance_to_rect(b) < distance_bbox
    && (p2.distance_to(q0) < distance_bbox || p3.distance_to(q1) < distance_bbox)
  {
    return true;
  }

  false
}

#[cfg(test)]
mod tests {
  use super::*;

  const D: f64 = 1.0;
  const D_BBOX: f64 = 0.001;

  #[test]
  fn same_location_is_not_overlap() {
    let a = Rect::new(10.0, 10.0, 50.0, 50.0);
    let b = Rect::new(10.0, 10.0, 50.0, 50.0);
    assert!(!check_overlap(&a, &b, D, D_BBOX));
  }

  #[test]
  fn containment_is_overlap() {
    let outer = Rect::new(0.0, 0.0, 100.0, 100.0);
    let inner = Rect::new(20.0, 20.0, 40.0, 40.0);
    assert!(check_overlap(&outer, &inner, D, D_BBOX));
    assert!(check_overlap(&inner, &outer, D, D_BBOX));
  }

  #[test]
  fn abutting_horizontal_tiles_overlap() {
    let left = Rect::new(100.0, 50.0, 400.0, 250.0);
    let right = Rect::new(399.5, 50.0, 700.0, 250.0);
    assert!(check_overlap(&left, &right, D, D_BBOX));
    assert!(check_overlap(&right, &left, D, D_BBOX));
  }

  #[test]
  fn abutting_vertical_tiles_overlap() {
    let top = Rect::new(10.0, 10.0, 200.0, 100.0);
    let bottom = Rect::new(10.0, 100.4, 200.0, 190.0);
    assert!(check_overlap(&top, &bottom, D, D_BBOX));
  }

  #[test]
  fn distant_rectangles_do_not_overlap() {
    let a = Rect::new(0.0, 0.0, 50.0, 50.0);
    let b = Rect::new(200.0, 200.0, 300.0, 300.0);
    assert!(!check_overlap(&a, &b, D, D_BBOX));
  }

  #[test]
  fn gap_wider_than_distance_is_no_overlap() {
    let left = Rect::new(0.0, 0.0, 100.0, 100.0);
    let right = Rect::new(101.5, 0.0, 200.0, 100.0);
    assert!(!check_overlap(&left, &right, D, D_BBOX));
  }

  #[test]
  fn corner_on_edge_with_corner_match() {
    // `a` ends exactly where `b` begins and shares the top corner.
    let a = Rect::new(0.0, 0.0, 100.0, 40.0);
    let b = Rect::new(100.0, 0.0, 300.0, 300.0);
    assert!(check_overlap(&a, &b, 0.0, D_BBOX));
  }

  #[test]
  fn include_grows_to_union() {
    let mut r = Rect::new(10.0, 10.0, 20.0, 20.0);
    r.include(&Rect::new(0.0, 15.0, 30.0, 40.0));
    assert_eq!(r, Rect::new(0.0, 10.0, 30.0, 40.0));
  }

  #[test]
  fn point_distance_to_rect_inside_is_zero() {
    let r = Rect::new(0.0, 0.0, 10.0, 10.0);
    assert_eq!(Point::new(5.0, 5.0).distance_to_rect(&r), 0.0);
  }

  #[test]
  fn point_distance_to_rect_outside() {
    let r = Rect::new(0.0, 0.0, 10.0, 10.0);
    assert_eq!(Point::new(13.0, 14.0).distance_to_rect(&r), 5.0);
  }

  #[test]
  fn matrix_scale_translate() {
    let m = Matrix::new(200.0, 0.0, 0.0, 150.0, 100.0, 500.0);
    let p = m.transform(Point::new(1.0, 1.0));
    assert_eq!(p, Point::new(300.0, 650.0));
  }

  #[test]
  fn matrix_then_composes_in_order() {
    let scale = Matrix::new(2.0, 0.0, 0.0, 2.0, 0.0, 0.0);
    let translate = Matrix::new(1.0, 0.0, 0.0, 1.0, 10.0, 20.0);
    // Scale first, then translate.
    let p = scale.then(&translate).transform(Point::new(3.0, 4.0));
    assert_eq!(p, Point::new(16.0, 28.0));
  }
}
