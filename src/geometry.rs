use faer::Mat;

use crate::elements::covalent_radius;
use crate::input::{DihedralConstraint, Molecule};

/// Slack added to the sum of covalent radii when deciding whether two atoms
/// are bonded, in Angstrom.
const BOND_TOLERANCE: f64 = 0.4;

const EPS: f64 = 1e-8;

// ── Public types ──────────────────────────────────────────────────────────────

/// Atom indices in errors are 1-based, as they appear in input files.
#[derive(Debug, PartialEq)]
pub enum GeometryError {
  AtomIndexOutOfRange { index: usize, n_atoms: usize },
  /// Three consecutive atoms of the dihedral are collinear.
  UndefinedDihedral([usize; 4]),
  /// The central atoms of the dihedral are not bonded.
  NotBonded { b: usize, c: usize },
  /// The central bond is part of a ring, so no fragment can rotate rigidly.
  RingBond { b: usize, c: usize },
}

impl std::fmt::Display for GeometryError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      GeometryError::AtomIndexOutOfRange { index, n_atoms } =>
        write!(f, "atom index {} is out of range; molecule has {} atoms", index, n_atoms),
      GeometryError::UndefinedDihedral(a) =>
        write!(f, "dihedral {}-{}-{}-{} is undefined (collinear atoms)", a[0], a[1], a[2], a[3]),
      GeometryError::NotBonded { b, c } =>
        write!(f, "atoms {} and {} are not bonded", b, c),
      GeometryError::RingBond { b, c } =>
        write!(f, "bond {}-{} is part of a ring and cannot be rotated", b, c),
    }
  }
}

// ── Public functions ──────────────────────────────────────────────────────────

pub fn distance(a: [f64; 3], b: [f64; 3]) -> f64 {
  norm(sub(a, b))
}

/// Dihedral angle p0-p1-p2-p3 in degrees, in [-180, 180], IUPAC sign
/// convention. `None` if three consecutive points are collinear.
pub fn dihedral_deg(p0: [f64; 3], p1: [f64; 3], p2: [f64; 3], p3: [f64; 3]) -> Option<f64> {
  let b0 = sub(p0, p1);
  let b1 = sub(p2, p1);
  let b2 = sub(p3, p2);

  let len = norm(b1);
  if len < EPS {
    return None;
  }
  let axis = scale(b1, 1.0 / len);

  // Components of b0 and b2 perpendicular to the central bond.
  let v = sub(b0, scale(axis, dot(b0, axis)));
  let w = sub(b2, scale(axis, dot(b2, axis)));
  if norm(v) < EPS || norm(w) < EPS {
    return None;
  }

  let x = dot(v, w);
  let y = dot(cross(axis, v), w);
  Some(y.atan2(x).to_degrees())
}

/// Adjacency lists (0-based) from interatomic distances.
pub fn bond_graph(mol: &Molecule) -> Vec<Vec<usize>> {
  let n = mol.n_atoms();
  let radii: Vec<f64> = mol.atoms.iter().map(|a| covalent_radius(&a.symbol)).collect();
  let positions: Vec<[f64; 3]> = (0..n).map(|i| mol.position_angstrom(i)).collect();

  let mut graph = vec![Vec::new(); n];
  for i in 0..n {
    for j in (i + 1)..n {
      if distance(positions[i], positions[j]) <= radii[i] + radii[j] + BOND_TOLERANCE {
        graph[i].push(j);
        graph[j].push(i);
      }
    }
  }
  graph
}

/// Current value in degrees of the dihedral named by `constraint`.
pub fn measure_dihedral(
  mol: &Molecule,
  constraint: &DihedralConstraint,
) -> Result<f64, GeometryError> {
  let idx = zero_based(mol, constraint.atoms)?;
  let p = |i: usize| mol.atoms[idx[i]].position;
  dihedral_deg(p(0), p(1), p(2), p(3))
    .ok_or(GeometryError::UndefinedDihedral(constraint.atoms))
}

/// Atoms (0-based) that move with `c` when the bond `b`-`c` is rotated: every
/// atom reachable from `c` without crossing that bond.
pub fn moving_fragment(
  graph: &[Vec<usize>],
  b: usize,
  c: usize,
) -> Result<Vec<usize>, GeometryError> {
  if !graph[c].contains(&b) {
    return Err(GeometryError::NotBonded { b: b + 1, c: c + 1 });
  }
  let mut seen = vec![false; graph.len()];
  let mut stack = vec![c];
  seen[c] = true;
  let mut fragment = Vec::new();
  while let Some(u) = stack.pop() {
    fragment.push(u);
    for &v in &graph[u] {
      if u == c && v == b {
        continue;
      }
      if v == b {
        return Err(GeometryError::RingBond { b: b + 1, c: c + 1 });
      }
      if !seen[v] {
        seen[v] = true;
        stack.push(v);
      }
    }
  }
  fragment.sort_unstable();
  Ok(fragment)
}

/// Rotate the fragment on the `atoms[2]` side of the central bond so that the
/// dihedral `atoms` (1-based) equals `target_deg`. Returns the rotation that
/// was applied, in degrees.
pub fn set_dihedral(
  mol: &mut Molecule,
  atoms: [usize; 4],
  target_deg: f64,
) -> Result<f64, GeometryError> {
  let current = measure_dihedral(mol, &DihedralConstraint { atoms, angle_deg: target_deg })?;
  let idx = zero_based(mol, atoms)?;
  let (a, b, c) = (idx[0], idx[1], idx[2]);

  let graph = bond_graph(mol);
  let fragment = moving_fragment(&graph, b, c)?;
  if fragment.contains(&a) {
    return Err(GeometryError::RingBond { b: atoms[1], c: atoms[2] });
  }

  let delta = (target_deg - current + 180.0).rem_euclid(360.0) - 180.0;
  let origin = mol.atoms[c].position;
  let axis = sub(origin, mol.atoms[b].position);
  let rot = rotation_matrix(axis, delta.to_radians());

  for &i in &fragment {
    mol.atoms[i].position = rotate_about(&rot, origin, mol.atoms[i].position);
  }
  log::debug!(
    "rotated {} atoms about {}-{} by {:.4} degrees ({:.4} -> {:.4})",
    fragment.len(), atoms[1], atoms[2], delta, current, target_deg
  );
  Ok(delta)
}

/// Right-handed rotation by `angle` radians about `axis` (Rodrigues' formula).
pub fn rotation_matrix(axis: [f64; 3], angle: f64) -> Mat<f64> {
  let k = scale(axis, 1.0 / norm(axis));
  let (s, c) = angle.sin_cos();
  let cross_k = [
    [0.0, -k[2], k[1]],
    [k[2], 0.0, -k[0]],
    [-k[1], k[0], 0.0],
  ];
  Mat::from_fn(3, 3, |i, j| {
    let identity = if i == j { 1.0 } else { 0.0 };
    c * identity + s * cross_k[i][j] + (1.0 - c) * k[i] * k[j]
  })
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn zero_based(mol: &Molecule, atoms: [usize; 4]) -> Result<[usize; 4], GeometryError> {
  let n_atoms = mol.n_atoms();
  let mut out = [0; 4];
  for (slot, &index) in out.iter_mut().zip(&atoms) {
    if index == 0 || index > n_atoms {
      return Err(GeometryError::AtomIndexOutOfRange { index, n_atoms });
    }
    *slot = index - 1;
  }
  Ok(out)
}

fn rotate_about(rot: &Mat<f64>, origin: [f64; 3], p: [f64; 3]) -> [f64; 3] {
  let v = Mat::from_fn(3, 1, |i, _| p[i] - origin[i]);
  let r = rot * &v;
  [origin[0] + r[(0, 0)], origin[1] + r[(1, 0)], origin[2] + r[(2, 0)]]
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
  [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn scale(a: [f64; 3], k: f64) -> [f64; 3] {
  [a[0] * k, a[1] * k, a[2] * k]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
  a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
  [
    a[1] * b[2] - a[2] * b[1],
    a[2] * b[0] - a[0] * b[2],
    a[0] * b[1] - a[1] * b[0],
  ]
}

fn norm(a: [f64; 3]) -> f64 {
  dot(a, a).sqrt()
}
