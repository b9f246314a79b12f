//! Group a page's image records into clusters that each compose one
//! figure candidate.
//!
//! Clustering runs to a fixed point over two passes: merging sets that
//! share members, then merging sets whose union bounding boxes overlap.
//! Termination is guaranteed because every merge strictly decreases the
//! number of sets.

use super::geometry::check_overlap;
use super::record::ImageRecord;
use crate::types::Tunables;
use std::collections::BTreeSet;

/// Partition `{0..figs.len()-1}` into clusters of overlapping records.
/// Records without a bbox come back as singleton clusters.
pub(crate) fn build_overlap_sets(figs: &[ImageRecord], t: &Tunables) -> Vec<BTreeSet<usize>> {
  let mut sets: Vec<BTreeSet<usize>> = Vec::with_capacity(figs.len());
  for i in 0..figs.len() {
    let mut set = BTreeSet::new();
    set.insert(i);
    for (j, other) in figs.iter().enumerate().skip(i + 1) {
      if has_overlap(&figs[i], other, t) {
        set.insert(j);
      }
    }
    sets.push(set);
  }

  union_intersections(&mut sets);
  loop {
    let before = sets.len();
    union_regions(figs, &mut sets, t);
    if sets.len() == before {
      break;
    }
  }
  sets
}

/// Stricter pairwise test than raw geometry. Mixing a mask into its base,
/// a grayscale inset into a photo, or two differently-encoded streams
/// produces garbage composites, so those pairs never overlap.
pub(crate) fn has_overlap(a: &ImageRecord, b: &ImageRecord, t: &Tunables) -> bool {
  let (Some(bbox_a), Some(bbox_b)) = (a.bbox, b.bbox) else {
    return false;
  };
  if a.has_alpha() || b.has_alpha() {
    return false;
  }
  if a.xref.is_some() && b.xref.is_some() && a.filter != b.filter {
    return false;
  }
  if a.colorspace != b.colorspace {
    return false;
  }
  if a.alt_colorspace != b.alt_colorspace {
    return false;
  }
  // Component counts can agree while the device colorspaces differ
  // (e.g. an ICC gray vs a separation ink), so compare those too.
  if a.xref.is_some() && b.xref.is_some() && a.resolved != b.resolved {
    return false;
  }
  check_overlap(&bbox_a, &bbox_b, t.overlap_distance, t.overlap_distance_bbox)
}

/// Merge any two sets with a non-empty intersection until stable.
fn union_intersections(sets: &mut Vec<BTreeSet<usize>>) {
  let mut restart = true;
  while restart {
    restart = false;
    'sweep: for i in 0..sets.len() {
      for j in (i + 1)..sets.len() {
        if !sets[i].is_disjoint(&sets[j]) {
          let absorbed = sets.remove(j);
          sets[i].extend(absorbed);
          restart = true;
          break 'sweep;
        }
      }
    }
  }
}

/// Merge clusters whose union bounding rectangles overlap, unless the two
/// clusters contain records painted at exactly the same location — that
/// pattern means legitimate separate figures stacked on one spot.
fn union_regions(figs: &[ImageRecord], sets: &mut Vec<BTreeSet<usize>>, t: &Tunables) {
  let mut regions: Vec<Option<ImageRecord>> = sets.iter().map(|s| region_record(figs, s)).collect();

  let mut restart = true;
  while restart {
    restart = false;
    'sweep: for i in 0..regions.len() {
      for j in (i + 1)..regions.len() {
        let overlap = match (&regions[i], &regions[j]) {
          (Some(a), Some(b)) => has_overlap(a, b, t),
          _ => false,
        };
        if overlap && !same_location_used(&sets[i], &sets[j], figs) {
          let bbox_j = regions[j].as_ref().and_then(|r| r.bbox);
          if let Some(rep) = regions[i].as_mut()
            && let (Some(bbox), Some(other)) = (rep.bbox.as_mut(), bbox_j)
          {
            bbox.include(&other);
          }
          let absorbed = sets.remove(j);
          sets[i].extend(absorbed);
          regions.remove(j);
          restart = true;
          break 'sweep;
        }
      }
    }
  }

  union_intersections(sets);
}

/// Representative record for a cluster: a copy of its first bbox-carrying
/// member, grown to the union of all member bboxes. `None` when no member
/// has a bbox.
fn region_record(figs: &[ImageRecord], set: &BTreeSet<usize>) -> Option<ImageRecord> {
  let first = set.iter().find(|&&i| figs[i].bbox.is_some())?;
  let mut rep = figs[*first].copy();
  let mut bbox = rep.bbox?;
  for &i in set {
    if let Some(b) = figs[i].bbox {
      bbox.include(&b);
    }
  }
  rep.bbox = Some(bbox);
  Some(rep)
}

fn same_location_used(a: &BTreeSet<usize>, b: &BTreeSet<usize>, figs: &[ImageRecord]) -> bool {
  for &i in a {
    for &j in b {
      if let (Some(bi), Some(bj)) = (figs[i].bbox, figs[j].bbox)
        && bi == bj
      {
        return true;
      }
    }
  }
  false
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::geometry::Rect;
  use crate::core::pixmap::Colorspace;

  fn record(bbox: Option<Rect>) -> ImageRecord {
    ImageRecord {
      xref: Some((1, 0)),
      ext: "flate".to_string(),
      filter: Some("FlateDecode".to_string()),
      colorspace: 3,
      alt_colorspace: None,
      smask: None,
      width: 100,
      height: 100,
      bbox,
      pixels: None,
      resolved: Some(Colorspace::Rgb),
    }
  }

  fn partition_is_valid(sets: &[BTreeSet<usize>], n: usize) {
    let mut seen = BTreeSet::new();
    for s in sets {
      for &i in s {
        assert!(seen.insert(i), "index {i} appears in two clusters");
      }
    }
    assert_eq!(seen.len(), n, "clusters must cover every record");
  }

  #[test]
  fn adjacent_tiles_cluster_together() {
    let figs = vec![
      record(Some(Rect::new(100.0, 50.0, 400.0, 250.0))),
      record(Some(Rect::new(399.5, 50.0, 700.0, 250.0))),
      record(Some(Rect::new(0.0, 500.0, 50.0, 550.0))),
    ];
    let t = Tunables::default();
    let sets = build_overlap_sets(&figs, &t);
    partition_is_valid(&sets, 3);
    assert_eq!(sets.len(), 2);
    assert!(sets.iter().any(|s| s.len() == 2 && s.contains(&0) && s.contains(&1)));
  }

  #[test]
  fn alpha_record_stays_isolated() {
    let mut masked = record(Some(Rect::new(100.0, 50.0, 400.0, 250.0)));
    masked.smask = Some((9, 0));
    let figs = vec![masked, record(Some(Rect::new(399.5, 50.0, 700.0, 250.0)))];
    let t = Tunables::default();
    let sets = build_overlap_sets(&figs, &t);
    partition_is_valid(&sets, 2);
    assert_eq!(sets.len(), 2);
  }

  #[test]
  fn filter_mismatch_prevents_merge() {
    let mut jpeg = record(Some(Rect::new(399.5, 50.0, 700.0, 250.0)));
    jpeg.filter = Some("DCTDecode".to_string());
    let figs = vec![record(Some(Rect::new(100.0, 50.0, 400.0, 250.0))), jpeg];
    let t = Tunables::default();
    let sets = build_overlap_sets(&figs, &t);
    assert_eq!(sets.len(), 2);
  }

  #[test]
  fn colorspace_mismatch_prevents_merge() {
    let mut gray = record(Some(Rect::new(399.5, 50.0, 700.0, 250.0)));
    gray.colorspace = 1;
    gray.resolved = Some(Colorspace::Gray);
    let figs = vec![record(Some(Rect::new(100.0, 50.0, 400.0, 250.0))), gray];
    let t = Tunables::default();
    let sets = build_overlap_sets(&figs, &t);
    assert_eq!(sets.len(), 2);
  }

  #[test]
  fn null_bbox_records_pass_through_as_singletons() {
    let figs = vec![
      record(None),
      record(Some(Rect::new(0.0, 0.0, 100.0, 100.0))),
      record(None),
    ];
    let t = Tunables::default();
    let sets = build_overlap_sets(&figs, &t);
    partition_is_valid(&sets, 3);
    assert_eq!(sets.len(), 3);
  }

  #[test]
  fn same_location_duplicates_stay_separate() {
    let figs = vec![
      record(Some(Rect::new(10.0, 10.0, 200.0, 200.0))),
      record(Some(Rect::new(10.0, 10.0, 200.0, 200.0))),
    ];
    let t = Tunables::default();
    let sets = build_overlap_sets(&figs, &t);
    assert_eq!(sets.len(), 2);
  }

  #[test]
  fn transitive_tiles_collapse_into_one_cluster() {
    // Three tiles in a row: 0-1 and 1-2 abut, so all three must unite.
    let figs = vec![
      record(Some(Rect::new(0.0, 0.0, 100.0, 100.0))),
      record(Some(Rect::new(100.0, 0.0, 200.0, 100.0))),
      record(Some(Rect::new(200.0, 0.0, 300.0, 100.0))),
    ];
    let t = Tunables::default();
    let sets = build_overlap_sets(&figs, &t);
    partition_is_valid(&sets, 3);
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].len(), 3);
  }
}
