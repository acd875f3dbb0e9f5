use std::fmt::Write;

use serde_json::{json, Map, Value};

use crate::input::{
  InputError, Molecule, OptionBlock, OptionValue, Routine, ScanInput, BOHR_TO_ANGSTROM,
};

/// XYZ rendering of `mol` in Angstrom. `title` defaults to the molecule name.
pub fn to_xyz(mol: &Molecule, title: Option<&str>) -> String {
  let mut out = String::new();
  let _ = writeln!(out, "{}", mol.n_atoms());
  let _ = writeln!(out, "{}", title.or(mol.name.as_deref()).unwrap_or(""));
  for (i, atom) in mol.atoms.iter().enumerate() {
    let [x, y, z] = mol.position_angstrom(i);
    let _ = writeln!(out, "{:<2} {:>15.8} {:>15.8} {:>15.8}", atom.symbol, x, y, z);
  }
  out
}

/// QCSchema document for the first routine call in `input`.
///
/// Optimisations become a `qcschema_optimization_input` whose gradient
/// request carries the global options and whose `keywords` carry the
/// `optking` block, with `program` naming the gradient program and
/// `procedure` the optimiser. Everything else is a plain `qcschema_input`
/// with the routine as driver. Variable references are resolved before export.
pub fn to_qcschema(input: &ScanInput) -> Result<Value, InputError> {
  let directive = input.directives.first().ok_or_else(|| {
    InputError::MissingBlock("routine call such as optimize(...)".to_string())
  })?;

  let mut model = Map::new();
  model.insert("method".to_string(), json!(directive.method()));
  if let Some(basis) = directive.basis() {
    model.insert("basis".to_string(), json!(basis));
  }
  let global = match input.global_options() {
    Some(block) => keywords(input, block)?,
    None => Map::new(),
  };
  let molecule = molecule_json(&input.molecule);

  if directive.routine != Routine::Optimize {
    return Ok(json!({
      "schema_name": "qcschema_input",
      "schema_version": 1,
      "molecule": molecule,
      "driver": directive.routine.as_str(),
      "model": model,
      "keywords": global,
    }));
  }

  let mut opt_keywords = match input.optking() {
    Some(block) => keywords(input, block)?,
    None => Map::new(),
  };
  opt_keywords.insert("program".to_string(), json!("psi4"));

  Ok(json!({
    "schema_name": "qcschema_optimization_input",
    "schema_version": 1,
    "procedure": "optking",
    "initial_molecule": molecule,
    "input_specification": {
      "schema_name": "qcschema_input",
      "schema_version": 1,
      "driver": "gradient",
      "model": model,
      "keywords": global,
    },
    "keywords": opt_keywords,
  }))
}

fn molecule_json(mol: &Molecule) -> Value {
  let symbols: Vec<&str> = mol.atoms.iter().map(|a| a.symbol.as_str()).collect();
  let geometry: Vec<f64> = (0..mol.n_atoms())
    .flat_map(|i| mol.position_angstrom(i))
    .map(|x| x / BOHR_TO_ANGSTROM)
    .collect();

  let mut obj = Map::new();
  obj.insert("schema_name".to_string(), json!("qcschema_molecule"));
  obj.insert("schema_version".to_string(), json!(2));
  obj.insert("symbols".to_string(), json!(symbols));
  obj.insert("geometry".to_string(), json!(geometry));
  obj.insert("molecular_charge".to_string(), json!(mol.charge));
  obj.insert("molecular_multiplicity".to_string(), json!(mol.multiplicity));
  obj.insert("fix_symmetry".to_string(), json!(mol.symmetry));
  obj.insert("fix_com".to_string(), json!(mol.no_com));
  obj.insert("fix_orientation".to_string(), json!(mol.no_reorient));
  if let Some(name) = &mol.name {
    obj.insert("name".to_string(), json!(name));
  }
  Value::Object(obj)
}

fn keywords(input: &ScanInput, block: &OptionBlock) -> Result<Map<String, Value>, InputError> {
  let mut map = Map::new();
  for (key, raw) in &block.entries {
    let value = match input.resolve(raw)? {
      OptionValue::Bool(b) => json!(b),
      OptionValue::Int(n) => json!(n),
      OptionValue::Float(x) => json!(x),
      OptionValue::Str(s) => json!(s),
      OptionValue::Variable(name) => return Err(InputError::UndefinedVariable(name)),
    };
    map.insert(key.clone(), value);
  }
  Ok(map)
}
