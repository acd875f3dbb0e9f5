use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::geometry::{set_dihedral, GeometryError};
use crate::input::{parse_input, InputError, ScanInput};
use crate::writer::write_input_file;

/// Tolerance, in degrees, when deciding whether `stop` or a full turn is hit.
const ANGLE_EPS: f64 = 1e-6;

/// Upper bound on the number of inputs one scan may produce.
const MAX_POINTS: usize = 100_000;

// ── Error type ────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum ScanError {
  IoError(String),
  InvalidYaml(String),
  MissingField(String),
  InvalidValue { field: String, reason: String },
  UnknownField(String),
  NoConstraint { requested: usize, available: usize },
  Input(InputError),
  Geometry { angle: f64, error: GeometryError },
  DuplicateFileName(PathBuf),
}

impl std::fmt::Display for ScanError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ScanError::IoError(s) =>
        write!(f, "I/O error: {}", s),
      ScanError::InvalidYaml(s) =>
        write!(f, "invalid YAML: {}", s),
      ScanError::MissingField(s) =>
        write!(f, "missing required field: {}", s),
      ScanError::InvalidValue { field, reason } =>
        write!(f, "invalid value for {}: {}", field, reason),
      ScanError::UnknownField(s) =>
        write!(f, "unknown scan field: {:?}", s),
      ScanError::NoConstraint { requested, available } =>
        write!(f, "constraint {} requested but the template has {} fixed dihedral(s)",
          requested, available),
      ScanError::Input(e) =>
        write!(f, "template: {}", e),
      ScanError::Geometry { angle, error } =>
        write!(f, "cannot set dihedral to {}: {}", angle, error),
      ScanError::DuplicateFileName(p) =>
        write!(f, "two scan angles map to the same file {}; use a coarser step", p.display()),
    }
  }
}

impl From<InputError> for ScanError {
  fn from(e: InputError) -> Self {
    ScanError::Input(e)
  }
}

// ── Public types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
  pub start: f64,
  pub stop: f64,
  pub step: f64,
  /// 1-based position in the template's `fixed_dihedral` list.
  pub constraint: usize,
  pub rotate_geometry: bool,
}

#[derive(Debug, PartialEq)]
pub struct ScanConfig {
  pub template: PathBuf,
  pub output_dir: PathBuf,
  pub name: Option<String>,
  pub plan: ScanPlan,
}

#[derive(Debug)]
pub struct ScanPoint {
  pub angle_deg: f64,
  pub input: ScanInput,
}

// ── Public functions ──────────────────────────────────────────────────────────

/// Reads the scan configuration at `path`. Relative paths inside it are
/// resolved against the directory containing `path`.
pub fn load_scan_config(path: &Path) -> Result<ScanConfig, ScanError> {
  let yaml = std::fs::read_to_string(path)
    .map_err(|e| ScanError::IoError(format!("{}: {}", path.display(), e)))?;
  let base = path.parent().unwrap_or_else(|| Path::new("."));
  parse_scan_config_str(&yaml, base)
}

pub fn parse_scan_config_str(yaml: &str, base_dir: &Path) -> Result<ScanConfig, ScanError> {
  let value: serde_yaml::Value = serde_yaml::from_str(yaml)
    .map_err(|e| ScanError::InvalidYaml(e.to_string()))?;
  let mapping = value.as_mapping().ok_or_else(|| ScanError::InvalidYaml(
    "expected a mapping at top level".to_string()
  ))?;

  const KNOWN: &[&str] = &[
    "template", "output_dir", "start", "stop", "step", "name", "constraint", "rotate_geometry",
  ];
  for (key, _) in mapping.iter() {
    match key.as_str() {
      Some(k) if KNOWN.contains(&k) => {}
      Some(k) => return Err(ScanError::UnknownField(k.to_string())),
      None => return Err(ScanError::UnknownField(format!("{:?}", key))),
    }
  }

  let template = base_dir.join(required_str(mapping, "template")?);
  let output_dir = base_dir.join(required_str(mapping, "output_dir")?);

  let start = required_angle(mapping, "start")?;
  let stop = required_angle(mapping, "stop")?;
  let step = required_angle(mapping, "step")?;
  if step <= 0.0 {
    return Err(ScanError::InvalidValue {
      field: "step".to_string(),
      reason: format!("must be > 0, got {}", step),
    });
  }
  if stop < start {
    return Err(ScanError::InvalidValue {
      field: "stop".to_string(),
      reason: format!("must be >= start ({}), got {}", start, stop),
    });
  }

  let n_points = grid_len(start, stop, step);
  if n_points > MAX_POINTS {
    return Err(ScanError::InvalidValue {
      field: "step".to_string(),
      reason: format!("{} gives {} scan points; at most {} are allowed", step, n_points, MAX_POINTS),
    });
  }

  let name = match map_get(mapping, "name") {
    Some(v) => {
      let s = v.as_str().ok_or_else(|| invalid("name", "expected a string"))?;
      if s.is_empty() || s.contains('/') {
        return Err(invalid("name", "must be a non-empty file name without '/'"));
      }
      Some(s.to_string())
    }
    None => None,
  };

  let constraint = match map_get(mapping, "constraint") {
    Some(v) => {
      let n = v.as_i64().ok_or_else(|| invalid("constraint", "expected an integer"))?;
      if n < 1 {
        return Err(ScanError::InvalidValue {
          field: "constraint".to_string(),
          reason: format!("must be >= 1, got {}", n),
        });
      }
      n as usize
    }
    None => 1,
  };

  let rotate_geometry = match map_get(mapping, "rotate_geometry") {
    Some(v) => v.as_bool().ok_or_else(|| invalid("rotate_geometry", "expected true or false"))?,
    None => true,
  };

  Ok(ScanConfig {
    template,
    output_dir,
    name,
    plan: ScanPlan { start, stop, step, constraint, rotate_geometry },
  })
}

/// Target angles `start + i*step` up to `stop`, without periodic duplicates.
pub fn scan_angles(plan: &ScanPlan) -> Vec<f64> {
  let n = grid_len(plan.start, plan.stop, plan.step);
  let mut angles: Vec<f64> = (0..n)
    .map(|i| plan.start + i as f64 * plan.step)
    .collect();

  let before = angles.len();
  angles.retain(|a| a - plan.start < 360.0 - ANGLE_EPS);
  if angles.len() < before {
    log::warn!("dropped angle(s) at or beyond one full turn from {}", plan.start);
  }
  angles
}

/// Build one input per scan angle from `template`.
pub fn generate_scan(template: &ScanInput, plan: &ScanPlan) -> Result<Vec<ScanPoint>, ScanError> {
  let mut constraints = template.optimizer_config()?.fixed_dihedrals;
  if plan.constraint == 0 || plan.constraint > constraints.len() {
    return Err(ScanError::NoConstraint {
      requested: plan.constraint,
      available: constraints.len(),
    });
  }
  let k = plan.constraint - 1;
  let atoms = constraints[k].atoms;

  let angles = scan_angles(plan);
  log::info!(
    "scanning dihedral {}-{}-{}-{} over {} point(s)",
    atoms[0], atoms[1], atoms[2], atoms[3], angles.len()
  );

  let mut points = Vec::with_capacity(angles.len());
  for angle in angles {
    let mut input = template.clone();
    constraints[k].angle_deg = angle;
    input.set_fixed_dihedrals(&constraints)?;
    if plan.rotate_geometry {
      set_dihedral(&mut input.molecule, atoms, angle)
        .map_err(|error| ScanError::Geometry { angle, error })?;
    }
    points.push(ScanPoint { angle_deg: angle, input });
  }
  Ok(points)
}

/// File-name fragment for an angle: `+090`, `-180`, or `+012.500`.
pub fn angle_label(angle: f64) -> String {
  if (angle - angle.round()).abs() < 1e-9 {
    format!("{:+04}", angle.round() as i64)
  } else {
    format!("{:+08.3}", angle)
  }
}

/// Generate the scan described by `config` and write one input file per
/// angle. Returns the written paths in scan order.
pub fn write_scan(config: &ScanConfig) -> Result<Vec<PathBuf>, ScanError> {
  let template = parse_input(&config.template)?;
  let points = generate_scan(&template, &config.plan)?;

  let stem = match &config.name {
    Some(n) => n.clone(),
    None => config.template
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_else(|| "scan".to_string()),
  };

  let mut paths: Vec<PathBuf> = Vec::with_capacity(points.len());
  let mut seen = HashSet::with_capacity(points.len());
  for point in &points {
    let path = config.output_dir.join(format!("{}_{}.dat", stem, angle_label(point.angle_deg)));
    if !seen.insert(path.clone()) {
      return Err(ScanError::DuplicateFileName(path));
    }
    paths.push(path);
  }

  std::fs::create_dir_all(&config.output_dir)
    .map_err(|e| ScanError::IoError(format!("{}: {}", config.output_dir.display(), e)))?;

  for (point, path) in points.iter().zip(&paths) {
    write_input_file(&point.input, path)?;
    log::info!("wrote {}", path.display());
  }
  Ok(paths)
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn map_get<'a>(
  m: &'a serde_yaml::Mapping,
  key: &str,
) -> Option<&'a serde_yaml::Value> {
  m.iter()
   .find(|(k, _)| k.as_str() == Some(key))
   .map(|(_, v)| v)
}

/// Points on the grid, counting at most one full turn from `start`.
fn grid_len(start: f64, stop: f64, step: f64) -> usize {
  let span = ((stop - start) / step + ANGLE_EPS).floor();
  let turn = ((360.0 - ANGLE_EPS) / step).ceil();
  span.min(turn) as usize + 1
}

fn invalid(field: &str, reason: &str) -> ScanError {
  ScanError::InvalidValue { field: field.to_string(), reason: reason.to_string() }
}

fn required_str<'a>(m: &'a serde_yaml::Mapping, key: &str) -> Result<&'a str, ScanError> {
  let s = map_get(m, key)
    .ok_or_else(|| ScanError::MissingField(key.to_string()))?
    .as_str()
    .ok_or_else(|| invalid(key, "expected a string"))?;
  if s.is_empty() {
    return Err(invalid(key, "must not be empty"));
  }
  Ok(s)
}

fn required_angle(m: &serde_yaml::Mapping, key: &str) -> Result<f64, ScanError> {
  let x = map_get(m, key)
    .ok_or_else(|| ScanError::MissingField(key.to_string()))?
    .as_f64()
    .ok_or_else(|| invalid(key, "expected a number of degrees"))?;
  if !x.is_finite() {
    return Err(invalid(key, "must be finite"));
  }
  Ok(x)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use super::*;
  use crate::geometry::measure_dihedral;
  use crate::input::parse_input_str;
  use tempfile::TempDir;

  const FIXTURE: &str = include_str!("../fixtures/butane_dihedral_90.dat");

  fn plan(start: f64, stop: f64, step: f64) -> ScanPlan {
    ScanPlan { start, stop, step, constraint: 1, rotate_geometry: true }
  }

  fn full_yaml() -> &'static str {
    "template: butane_dihedral_90.dat\n\
     output_dir: out\n\
     start: -180\n\
     stop: 180\n\
     step: 15\n"
  }

  // ── Config ──────────────────────────────────────────────────────────────────

  #[test]
  fn test_config_defaults_and_relative_paths() {
    let cfg = parse_scan_config_str(full_yaml(), Path::new("/data/scans")).unwrap();
    assert_eq!(cfg.template, PathBuf::from("/data/scans/butane_dihedral_90.dat"));
    assert_eq!(cfg.output_dir, PathBuf::from("/data/scans/out"));
    assert_eq!(cfg.name, None);
    assert_eq!(cfg.plan, plan(-180.0, 180.0, 15.0));
  }

  #[test]
  fn test_config_optional_fields() {
    let yaml = format!("{}name: butane\nconstraint: 2\nrotate_geometry: false\n", full_yaml());
    let cfg = parse_scan_config_str(&yaml, Path::new(".")).unwrap();
    assert_eq!(cfg.name.as_deref(), Some("butane"));
    assert_eq!(cfg.plan.constraint, 2);
    assert!(!cfg.plan.rotate_geometry);
  }

  #[test]
  fn test_config_absolute_template_kept() {
    let yaml = full_yaml().replace("butane_dihedral_90.dat", "/abs/t.dat");
    let cfg = parse_scan_config_str(&yaml, Path::new("/data")).unwrap();
    assert_eq!(cfg.template, PathBuf::from("/abs/t.dat"));
  }

  #[test]
  fn test_config_missing_field() {
    let yaml = full_yaml().replace("step: 15\n", "");
    assert_eq!(
      parse_scan_config_str(&yaml, Path::new(".")),
      Err(ScanError::MissingField("step".to_string()))
    );
  }

  #[test]
  fn test_config_unknown_field() {
    let yaml = format!("{}steps: 3\n", full_yaml());
    assert_eq!(
      parse_scan_config_str(&yaml, Path::new(".")),
      Err(ScanError::UnknownField("steps".to_string()))
    );
  }

  #[test]
  fn test_config_invalid_values() {
    for (from, to) in [
      ("step: 15", "step: 0"),
      ("step: 15", "step: -5"),
      ("stop: 180", "stop: -200"),
      ("start: -180", "start: west"),
    ] {
      let yaml = full_yaml().replace(from, to);
      assert!(
        matches!(parse_scan_config_str(&yaml, Path::new(".")), Err(ScanError::InvalidValue { .. })),
        "accepted {:?}", to
      );
    }
    let yaml = format!("{}constraint: 0\n", full_yaml());
    assert!(matches!(
      parse_scan_config_str(&yaml, Path::new(".")),
      Err(ScanError::InvalidValue { .. })
    ));
  }

  #[test]
  fn test_config_non_string_key_is_named() {
    let yaml = format!("{}1: x\n", full_yaml());
    match parse_scan_config_str(&yaml, Path::new(".")) {
      Err(ScanError::UnknownField(k)) => assert!(k.contains('1'), "key reported as {:?}", k),
      other => panic!("expected UnknownField, got {:?}", other),
    }
  }

  #[test]
  fn test_config_too_many_points() {
    let yaml = full_yaml().replace("step: 15", "step: 0.001");
    assert!(matches!(
      parse_scan_config_str(&yaml, Path::new(".")),
      Err(ScanError::InvalidValue { ref field, .. }) if field == "step"
    ));
  }

  #[test]
  fn test_config_invalid_yaml() {
    assert!(matches!(
      parse_scan_config_str("template: [unclosed", Path::new(".")),
      Err(ScanError::InvalidYaml(_))
    ));
    assert!(matches!(
      parse_scan_config_str("- a\n- b\n", Path::new(".")),
      Err(ScanError::InvalidYaml(_))
    ));
  }

  #[test]
  fn test_load_scan_config_missing_file() {
    let path = Path::new("/tmp/nonexistent_torscan_scan.yaml");
    assert!(matches!(load_scan_config(path), Err(ScanError::IoError(_))));
  }

  // ── Angles ──────────────────────────────────────────────────────────────────

  #[test]
  fn test_full_turn_drops_duplicate() {
    let angles = scan_angles(&plan(-180.0, 180.0, 15.0));
    assert_eq!(angles.len(), 24);
    assert_eq!(angles[0], -180.0);
    assert_eq!(*angles.last().unwrap(), 165.0);
  }

  #[test]
  fn test_huge_stop_is_capped_at_one_turn() {
    let yaml = full_yaml().replace("start: -180", "start: 0").replace("stop: 180", "stop: 1.0e300");
    let yaml = yaml.replace("step: 15", "step: 1");
    let cfg = parse_scan_config_str(&yaml, Path::new(".")).unwrap();
    let angles = scan_angles(&cfg.plan);
    assert_eq!(angles.len(), 360);
    assert_eq!(*angles.last().unwrap(), 359.0);

    let angles = scan_angles(&plan(-10.0, 1e10, 30.0));
    assert_eq!(angles.len(), 12);
  }

  #[test]
  fn test_partial_range_includes_stop() {
    assert_eq!(scan_angles(&plan(0.0, 90.0, 30.0)), vec![0.0, 30.0, 60.0, 90.0]);
    assert_eq!(scan_angles(&plan(0.0, 100.0, 30.0)), vec![0.0, 30.0, 60.0, 90.0]);
    assert_eq!(scan_angles(&plan(45.0, 45.0, 10.0)), vec![45.0]);
  }

  #[test]
  fn test_angles_do_not_drift() {
    let angles = scan_angles(&plan(0.0, 1.0, 0.1));
    assert_eq!(angles.len(), 11);
    assert!((angles[10] - 1.0).abs() < 1e-12);
  }

  #[test]
  fn test_angle_labels() {
    assert_eq!(angle_label(90.0), "+090");
    assert_eq!(angle_label(-180.0), "-180");
    assert_eq!(angle_label(0.0), "+000");
    assert_eq!(angle_label(-5.0), "-005");
    assert_eq!(angle_label(12.5), "+012.500");
  }

  // ── Generation ──────────────────────────────────────────────────────────────

  #[test]
  fn test_generate_rewrites_constraint_and_geometry() {
    let template = parse_input_str(FIXTURE).unwrap();
    let points = generate_scan(&template, &plan(0.0, 180.0, 60.0)).unwrap();
    assert_eq!(points.len(), 4);
    for p in &points {
      let cfg = p.input.optimizer_config().unwrap();
      assert_eq!(cfg.fixed_dihedrals[0].atoms, [10, 7, 4, 3]);
      assert_eq!(cfg.fixed_dihedrals[0].angle_deg, p.angle_deg);
      assert_eq!(cfg.geom_maxiter, Some(250));
      let phi = measure_dihedral(&p.input.molecule, &cfg.fixed_dihedrals[0]).unwrap();
      let diff = (phi - p.angle_deg + 180.0).rem_euclid(360.0) - 180.0;
      assert!(diff.abs() < 1e-8, "angle {} measured {}", p.angle_deg, phi);
    }
    assert_eq!(points[2].input.variable("dih_string"), Some("10 7 4 3 120"));
  }

  #[test]
  fn test_generate_without_rotation_keeps_geometry() {
    let template = parse_input_str(FIXTURE).unwrap();
    let mut p = plan(0.0, 30.0, 30.0);
    p.rotate_geometry = false;
    let points = generate_scan(&template, &p).unwrap();
    for point in &points {
      assert_eq!(point.input.molecule, template.molecule);
    }
  }

  #[test]
  fn test_generate_missing_constraint() {
    let template = parse_input_str(FIXTURE).unwrap();
    let mut p = plan(0.0, 30.0, 30.0);
    p.constraint = 2;
    assert!(matches!(
      generate_scan(&template, &p),
      Err(ScanError::NoConstraint { requested: 2, available: 1 })
    ));
  }

  #[test]
  fn test_generate_only_touches_selected_constraint() {
    let text = FIXTURE.replace("10 7 4 3 90", "10 7 4 3 90 1 3 4 5 -60");
    let template = parse_input_str(&text).unwrap();
    let mut p = plan(30.0, 30.0, 1.0);
    p.rotate_geometry = false;
    let points = generate_scan(&template, &p).unwrap();
    assert_eq!(points[0].input.variable("dih_string"), Some("10 7 4 3 30 1 3 4 5 -60"));
  }

  // ── Files ───────────────────────────────────────────────────────────────────

  #[test]
  fn test_write_scan_end_to_end() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("butane_dihedral_90.dat"), FIXTURE).unwrap();
    let cfg_path = dir.path().join("scan.yaml");
    std::fs::write(&cfg_path, format!("{}name: butane\n", full_yaml())).unwrap();

    let cfg = load_scan_config(&cfg_path).unwrap();
    let paths = write_scan(&cfg).unwrap();
    assert_eq!(paths.len(), 24);
    assert_eq!(paths[0], dir.path().join("out").join("butane_-180.dat"));
    assert_eq!(paths[18], dir.path().join("out").join("butane_+090.dat"));

    let point = parse_input(&paths[18]).unwrap();
    let cfg = point.optimizer_config().unwrap();
    assert_eq!(cfg.fixed_dihedrals[0].angle_deg, 90.0);
    assert_eq!(point.directives[0].level, "MP2/aug-cc-pvtz");
    let phi = measure_dihedral(&point.molecule, &cfg.fixed_dihedrals[0]).unwrap();
    assert!((phi - 90.0).abs() < 1e-6);
  }

  #[test]
  fn test_write_scan_default_name_from_template() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("butane_dihedral_90.dat"), FIXTURE).unwrap();
    let yaml = full_yaml().replace("start: -180", "start: 0").replace("stop: 180", "stop: 15");
    let cfg = parse_scan_config_str(&yaml, dir.path()).unwrap();
    let paths = write_scan(&cfg).unwrap();
    assert_eq!(paths[1].file_name().unwrap(), "butane_dihedral_90_+015.dat");
  }

  #[test]
  fn test_write_scan_rejects_colliding_file_names() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("butane_dihedral_90.dat"), FIXTURE).unwrap();
    let yaml = full_yaml()
      .replace("start: -180", "start: 0")
      .replace("stop: 180", "stop: 0.0009")
      .replace("step: 15", "step: 0.0001");
    let cfg = parse_scan_config_str(&yaml, dir.path()).unwrap();
    assert!(matches!(write_scan(&cfg), Err(ScanError::DuplicateFileName(_))));
    assert!(!dir.path().join("out").exists());
  }

  #[test]
  fn test_write_scan_missing_template() {
    let dir = TempDir::new().unwrap();
    let cfg = parse_scan_config_str(full_yaml(), dir.path()).unwrap();
    assert!(matches!(write_scan(&cfg), Err(ScanError::Input(InputError::IoError(_)))));
  }
}
