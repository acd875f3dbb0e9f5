use std::fmt::Write;
use std::path::Path;

use crate::input::{classify_bare, InputError, Molecule, OptionBlock, OptionValue, ScanInput};

/// Render `input` as a Psi4 input file. Parsing the result gives back an
/// equivalent [`ScanInput`]; spacing and key/value separators are canonical
/// rather than copied from the source.
pub fn write_input(input: &ScanInput) -> String {
  let mut out = String::new();

  if let Some(memory) = &input.memory {
    let _ = writeln!(out, "memory {}\n", memory);
  }

  write_molecule(&mut out, &input.molecule);

  if !input.variables.is_empty() {
    out.push('\n');
    for (name, value) in &input.variables {
      let _ = writeln!(out, "{} = {}", name, quote(value));
    }
  }

  for block in &input.options {
    out.push('\n');
    write_block(&mut out, block);
  }

  out.push('\n');
  for d in &input.directives {
    let mut args = vec![format!("'{}'", d.level)];
    args.extend(d.extra_args.iter().cloned());
    let _ = writeln!(out, "{}({})", d.name, args.join(", "));
  }

  out
}

pub fn write_input_file(input: &ScanInput, path: &Path) -> Result<(), InputError> {
  std::fs::write(path, write_input(input))
    .map_err(|e| InputError::IoError(format!("{}: {}", path.display(), e)))
}

fn write_molecule(out: &mut String, mol: &Molecule) {
  match &mol.name {
    Some(name) => { let _ = writeln!(out, "molecule {} {{", name); }
    None => out.push_str("molecule {\n"),
  }
  if let Some(sym) = &mol.symmetry {
    let _ = writeln!(out, "symmetry {}", sym);
  }
  if mol.no_reorient {
    out.push_str("no_reorient\n");
  }
  if mol.no_com {
    out.push_str("no_com\n");
  }
  let _ = writeln!(out, "{} {}", mol.charge, mol.multiplicity);
  for atom in &mol.atoms {
    let [x, y, z] = atom.position;
    let _ = writeln!(out, " {:<4}{:>17.10}{:>17.10}{:>17.10}", atom.label, x, y, z);
  }
  let _ = writeln!(out, "units {}", mol.units.keyword());
  out.push_str("}\n");
}

fn write_block(out: &mut String, block: &OptionBlock) {
  match &block.module {
    Some(module) => { let _ = writeln!(out, "set {} {{", module); }
    None => out.push_str("set {\n"),
  }
  for (key, value) in &block.entries {
    let _ = writeln!(out, "  {} {}", key, format_value(value));
  }
  out.push_str("}\n");
}

fn format_value(value: &OptionValue) -> String {
  match value {
    OptionValue::Bool(true) => "True".to_string(),
    OptionValue::Bool(false) => "False".to_string(),
    OptionValue::Int(n) => n.to_string(),
    // Debug keeps the decimal point, so `1.0` does not come back as an Int.
    OptionValue::Float(x) => format!("{:?}", x),
    OptionValue::Str(s) => {
      if needs_quotes(s) { quote(s) } else { s.clone() }
    }
    OptionValue::Variable(name) => format!("${}", name),
  }
}

fn needs_quotes(s: &str) -> bool {
  s.is_empty()
    || s.chars().any(|c| c.is_whitespace() || c == '#' || c == '"' || c == '\'')
    || s.starts_with('$')
    || !matches!(classify_bare(s), OptionValue::Str(_))
}

fn quote(s: &str) -> String {
  if s.contains('"') { format!("'{}'", s) } else { format!("\"{}\"", s) }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::input::{parse_input, parse_input_str, Units};

  const FIXTURE: &str = include_str!("../fixtures/butane_dihedral_90.dat");

  fn assert_equivalent(a: &ScanInput, b: &ScanInput) {
    assert_eq!(a.molecule.n_atoms(), b.molecule.n_atoms());
    for (x, y) in a.molecule.atoms.iter().zip(&b.molecule.atoms) {
      assert_eq!(x.label, y.label);
      for k in 0..3 {
        assert!((x.position[k] - y.position[k]).abs() < 1e-9);
      }
    }
    assert_eq!(a.molecule.name, b.molecule.name);
    assert_eq!(a.molecule.symmetry, b.molecule.symmetry);
    assert_eq!(a.molecule.charge, b.molecule.charge);
    assert_eq!(a.molecule.multiplicity, b.molecule.multiplicity);
    assert_eq!(a.molecule.units, b.molecule.units);
    assert_eq!(a.variables, b.variables);
    assert_eq!(a.options, b.options);
    assert_eq!(a.directives, b.directives);
    assert_eq!(a.optimizer_config().unwrap(), b.optimizer_config().unwrap());
  }

  #[test]
  fn test_fixture_reserialises_equivalently() {
    let parsed = parse_input_str(FIXTURE).unwrap();
    let text = write_input(&parsed);
    let again = parse_input_str(&text).unwrap();
    assert_equivalent(&parsed, &again);
  }

  #[test]
  fn test_fixture_output_layout() {
    let text = write_input(&parse_input_str(FIXTURE).unwrap());
    assert!(text.starts_with("molecule butane {\nsymmetry c1\n0 1\n"));
    assert!(text.contains("units Angstrom\n}\n"));
    assert!(text.contains("dih_string = \"10 7 4 3 90\"\n"));
    assert!(text.contains("set optking {\n  fixed_dihedral $dih_string\n"));
    assert!(text.contains("  print_trajectory_xyz_file True\n"));
    assert!(text.trim_end().ends_with("optimize('MP2/aug-cc-pvtz')"));
  }

  #[test]
  fn test_ambiguous_strings_are_quoted() {
    assert_eq!(format_value(&OptionValue::Str("aug-cc-pvtz".to_string())), "aug-cc-pvtz");
    assert_eq!(format_value(&OptionValue::Str("250".to_string())), "\"250\"");
    assert_eq!(format_value(&OptionValue::Str("true".to_string())), "\"true\"");
    assert_eq!(format_value(&OptionValue::Str("a b".to_string())), "\"a b\"");
    assert_eq!(format_value(&OptionValue::Float(1.0)), "1.0");
    assert_eq!(format_value(&OptionValue::Float(1e-8)), "1e-8");
  }

  #[test]
  fn test_everything_round_trips() {
    let text = "memory 500 mb\n\
      molecule {\n\
      no_reorient\n\
      1 3\n\
      O1 0.0 0.0 0.0\n\
      H 0.0 0.0 1.8\n\
      units bohr\n\
      }\n\
      label = \"it's\"\n\
      set {\n  basis cc-pvdz\n  e_convergence 1.0\n  tag \"123\"\n}\n\
      gradient('hf', dertype=1)\n";
    let parsed = parse_input_str(text).unwrap();
    let again = parse_input_str(&write_input(&parsed)).unwrap();
    assert_equivalent(&parsed, &again);
    assert_eq!(again.memory.as_deref(), Some("500 mb"));
    assert!(again.molecule.no_reorient);
    assert_eq!(again.molecule.units, Units::Bohr);
  }

  #[test]
  fn test_write_input_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("out.dat");
    let input = parse_input_str(FIXTURE).unwrap();
    write_input_file(&input, &path).unwrap();
    assert_equivalent(&input, &parse_input(&path).unwrap());
  }

  #[test]
  fn test_write_input_file_bad_directory() {
    let input = parse_input_str(FIXTURE).unwrap();
    let path = Path::new("/nonexistent_torscan_dir/out.dat");
    assert!(matches!(write_input_file(&input, path), Err(InputError::IoError(_))));
  }
}
