use std::path::Path;

use crate::elements::{atomic_number, element_from_label};

// ── Error type ────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum InputError {
  IoError(String),
  Syntax { line: usize, reason: String },
  MissingBlock(String),
  DuplicateBlock(String),
  InvalidElement { line: usize, label: String },
  InvalidValue { field: String, reason: String },
  UndefinedVariable(String),
  AtomIndexOutOfRange { index: usize, n_atoms: usize },
  InvalidDihedral(String),
  InconsistentSpin { electrons: i64, multiplicity: u32 },
}

impl std::fmt::Display for InputError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      InputError::IoError(s) =>
        write!(f, "I/O error: {}", s),
      InputError::Syntax { line, reason } =>
        write!(f, "line {}: {}", line, reason),
      InputError::MissingBlock(s) =>
        write!(f, "input contains no {}", s),
      InputError::DuplicateBlock(s) =>
        write!(f, "input contains more than one {}", s),
      InputError::InvalidElement { line, label } =>
        write!(f, "line {}: unknown element in atom label {:?}", line, label),
      InputError::InvalidValue { field, reason } =>
        write!(f, "invalid value for {}: {}", field, reason),
      InputError::UndefinedVariable(s) =>
        write!(f, "option refers to undefined variable ${}", s),
      InputError::AtomIndexOutOfRange { index, n_atoms } =>
        write!(f, "atom index {} is out of range; molecule has {} atoms", index, n_atoms),
      InputError::InvalidDihedral(s) =>
        write!(f, "invalid fixed_dihedral: {}", s),
      InputError::InconsistentSpin { electrons, multiplicity } =>
        write!(f, "multiplicity {} is impossible with {} electrons", multiplicity, electrons),
    }
  }
}

// ── Public types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Units {
  Angstrom,
  Bohr,
}

pub const BOHR_TO_ANGSTROM: f64 = 0.52917721067;

impl Units {
  pub fn keyword(&self) -> &'static str {
    match self {
      Units::Angstrom => "Angstrom",
      Units::Bohr => "Bohr",
    }
  }

  /// Factor that converts a coordinate in these units to Angstrom.
  pub fn to_angstrom(&self) -> f64 {
    match self {
      Units::Angstrom => 1.0,
      Units::Bohr => BOHR_TO_ANGSTROM,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
  /// Label as written in the file, e.g. `C` or `C12`.
  pub label: String,
  /// Normalised element symbol.
  pub symbol: String,
  /// Cartesian position in the owning molecule's units.
  pub position: [f64; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub struct Molecule {
  pub name: Option<String>,
  pub symmetry: Option<String>,
  pub charge: i32,
  pub multiplicity: u32,
  pub units: Units,
  pub no_reorient: bool,
  pub no_com: bool,
  pub atoms: Vec<Atom>,
}

impl Molecule {
  pub fn n_atoms(&self) -> usize {
    self.atoms.len()
  }

  /// Position of atom `idx` (0-based) in Angstrom.
  pub fn position_angstrom(&self, idx: usize) -> [f64; 3] {
    let k = self.units.to_angstrom();
    let p = self.atoms[idx].position;
    [p[0] * k, p[1] * k, p[2] * k]
  }

  pub fn electron_count(&self) -> i64 {
    let protons: i64 = self.atoms
      .iter()
      .map(|a| atomic_number(&a.symbol).unwrap_or(0) as i64)
      .sum();
    protons - self.charge as i64
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
  /// A `$name` reference to a string variable.
  Variable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptionBlock {
  /// `None` for a global `set { }` block.
  pub module: Option<String>,
  /// Keys are stored lower-case, in file order.
  pub entries: Vec<(String, OptionValue)>,
}

impl OptionBlock {
  pub fn get(&self, key: &str) -> Option<&OptionValue> {
    self.entries
      .iter()
      .find(|(k, _)| k == key)
      .map(|(_, v)| v)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DihedralConstraint {
  /// 1-based atom indices.
  pub atoms: [usize; 4],
  pub angle_deg: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Routine {
  Optimize,
  Energy,
  Gradient,
  Frequency,
  Hessian,
}

impl Routine {
  pub fn as_str(&self) -> &'static str {
    match self {
      Routine::Optimize => "optimize",
      Routine::Energy => "energy",
      Routine::Gradient => "gradient",
      Routine::Frequency => "frequency",
      Routine::Hessian => "hessian",
    }
  }

  fn from_name(name: &str) -> Option<Self> {
    let bare = name.strip_prefix("psi4.").unwrap_or(name);
    match bare.to_lowercase().as_str() {
      "optimize" | "opt" => Some(Routine::Optimize),
      "energy" => Some(Routine::Energy),
      "gradient" => Some(Routine::Gradient),
      "frequency" | "frequencies" | "freq" => Some(Routine::Frequency),
      "hessian" => Some(Routine::Hessian),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
  pub routine: Routine,
  /// Function name as written, e.g. `opt` or `optimize`.
  pub name: String,
  /// Level of theory, e.g. `MP2/aug-cc-pvtz`.
  pub level: String,
  /// Remaining `key=value` arguments, verbatim.
  pub extra_args: Vec<String>,
}

impl Directive {
  pub fn method(&self) -> String {
    match self.level.split_once('/') {
      Some((m, _)) => m.to_lowercase(),
      None => self.level.to_lowercase(),
    }
  }

  pub fn basis(&self) -> Option<String> {
    self.level.split_once('/').map(|(_, b)| b.to_lowercase())
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizerConfig {
  pub fixed_dihedrals: Vec<DihedralConstraint>,
  pub dynamic_level: Option<i64>,
  pub geom_maxiter: Option<i64>,
  pub print_trajectory_xyz_file: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanInput {
  pub memory: Option<String>,
  pub molecule: Molecule,
  /// String variables in file order.
  pub variables: Vec<(String, String)>,
  pub options: Vec<OptionBlock>,
  pub directives: Vec<Directive>,
}

impl ScanInput {
  pub fn variable(&self, name: &str) -> Option<&str> {
    self.variables
      .iter()
      .find(|(n, _)| n == name)
      .map(|(_, v)| v.as_str())
  }

  pub fn optking(&self) -> Option<&OptionBlock> {
    self.options
      .iter()
      .find(|b| b.module.as_deref() == Some("optking"))
  }

  pub fn global_options(&self) -> Option<&OptionBlock> {
    self.options.iter().find(|b| b.module.is_none())
  }

  /// Substitute a `$name` reference with the variable's contents.
  pub fn resolve(&self, value: &OptionValue) -> Result<OptionValue, InputError> {
    match value {
      OptionValue::Variable(name) => self.variable(name)
        .map(classify_bare)
        .ok_or_else(|| InputError::UndefinedVariable(name.clone())),
      other => Ok(other.clone()),
    }
  }

  /// Typed view of the `optking` block, with variables resolved and every
  /// recognised key validated.
  pub fn optimizer_config(&self) -> Result<OptimizerConfig, InputError> {
    let mut config = OptimizerConfig::default();
    let block = match self.optking() {
      Some(b) => b,
      None => return Ok(config),
    };
    for (key, raw) in &block.entries {
      let value = self.resolve(raw)?;
      match key.as_str() {
        "fixed_dihedral" => {
          let text = match value {
            OptionValue::Str(s) => s,
            _ => return Err(InputError::InvalidDihedral(
              "expected a string of atom indices and angles".to_string()
            )),
          };
          config.fixed_dihedrals = parse_dihedrals(&text, self.molecule.n_atoms())?;
        }
        "dynamic_level" => {
          let n = expect_int("optking.dynamic_level", &value)?;
          if !(0..=6).contains(&n) {
            return Err(InputError::InvalidValue {
              field: "optking.dynamic_level".to_string(),
              reason: format!("must be between 0 and 6, got {}", n),
            });
          }
          config.dynamic_level = Some(n);
        }
        "geom_maxiter" => {
          let n = expect_int("optking.geom_maxiter", &value)?;
          if n <= 0 {
            return Err(InputError::InvalidValue {
              field: "optking.geom_maxiter".to_string(),
              reason: format!("must be > 0, got {}", n),
            });
          }
          config.geom_maxiter = Some(n);
        }
        "print_trajectory_xyz_file" => match value {
          OptionValue::Bool(b) => config.print_trajectory_xyz_file = Some(b),
          _ => return Err(InputError::InvalidValue {
            field: "optking.print_trajectory_xyz_file".to_string(),
            reason: "expected True or False".to_string(),
          }),
        },
        _ => {}
      }
    }
    Ok(config)
  }

  /// Replace the `fixed_dihedral` constraint string. When the option points at
  /// a variable, the variable is rewritten and the reference kept.
  pub fn set_fixed_dihedrals(
    &mut self,
    constraints: &[DihedralConstraint],
  ) -> Result<(), InputError> {
    let text = format_dihedrals(constraints);
    parse_dihedrals(&text, self.molecule.n_atoms())?;

    let block_idx = match self.options
      .iter()
      .position(|b| b.module.as_deref() == Some("optking"))
    {
      Some(i) => i,
      None => {
        self.options.push(OptionBlock {
          module: Some("optking".to_string()),
          entries: Vec::new(),
        });
        self.options.len() - 1
      }
    };
    let block = &mut self.options[block_idx];

    let entry = block.entries.iter().position(|(k, _)| k == "fixed_dihedral");
    match entry {
      None => block.entries.push(("fixed_dihedral".to_string(), OptionValue::Str(text))),
      Some(p) => match &mut block.entries[p].1 {
        OptionValue::Variable(name) => {
          let var = self.variables
            .iter_mut()
            .find(|(n, _)| n == name)
            .ok_or_else(|| InputError::UndefinedVariable(name.clone()))?;
          var.1 = text;
        }
        value => *value = OptionValue::Str(text),
      },
    }
    Ok(())
  }
}

// ── Public functions ──────────────────────────────────────────────────────────

/// Reads the file at `path` and delegates to [`parse_input_str`].
pub fn parse_input(path: &Path) -> Result<ScanInput, InputError> {
  let text = std::fs::read_to_string(path)
    .map_err(|e| InputError::IoError(e.to_string()))?;
  parse_input_str(&text)
}

/// Parses and fully validates a Psi4 input string.
pub fn parse_input_str(text: &str) -> Result<ScanInput, InputError> {
  let lines: Vec<(usize, String)> = text
    .lines()
    .enumerate()
    .map(|(i, l)| (i + 1, strip_comment(l).trim().to_string()))
    .filter(|(_, l)| !l.is_empty())
    .collect();

  let mut memory = None;
  let mut molecule = None;
  let mut variables: Vec<(String, String)> = Vec::new();
  let mut options: Vec<OptionBlock> = Vec::new();
  let mut directives = Vec::new();

  let mut i = 0;
  while i < lines.len() {
    let (line_no, line) = (lines[i].0, lines[i].1.as_str());

    if let Some(rest) = keyword_rest(line, "molecule") {
      if molecule.is_some() {
        return Err(InputError::DuplicateBlock("molecule block".to_string()));
      }
      let name = block_header(line_no, rest, "molecule")?;
      let (body, next) = block_body(&lines, i, "molecule")?;
      molecule = Some(parse_molecule(name, body)?);
      i = next;
      continue;
    }

    if let Some(rest) = keyword_rest(line, "set") {
      if !directives.is_empty() {
        return Err(after_routine(line_no, "set"));
      }
      if rest.trim_end().ends_with('{') {
        let module = block_header(line_no, rest, "set")?
          .map(|m| m.to_lowercase());
        let (body, next) = block_body(&lines, i, "set")?;
        let mut entries = Vec::with_capacity(body.len());
        for (n, l) in body {
          entries.push(parse_option_line(*n, l)?);
        }
        merge_options(&mut options, module, entries);
        i = next;
        continue;
      }
      let (module, entry) = parse_set_line(line_no, rest)?;
      merge_options(&mut options, module, vec![entry]);
      i += 1;
      continue;
    }

    if let Some(rest) = keyword_rest(line, "memory") {
      let amount = rest.split_whitespace().next().unwrap_or("");
      if amount.parse::<f64>().is_err() {
        return Err(syntax(line_no, "memory must start with a number, e.g. `memory 2 gb`"));
      }
      memory = Some(rest.split_whitespace().collect::<Vec<_>>().join(" "));
      i += 1;
      continue;
    }

    if let Some((name, value)) = parse_variable(line_no, line)? {
      if !directives.is_empty() {
        return Err(after_routine(line_no, "variable"));
      }
      match variables.iter().position(|(n, _)| *n == name) {
        Some(p) => variables[p].1 = value,
        None => variables.push((name, value)),
      }
      i += 1;
      continue;
    }

    directives.push(parse_directive(line_no, line)?);
    i += 1;
  }

  let molecule = molecule
    .ok_or_else(|| InputError::MissingBlock("molecule block".to_string()))?;
  if directives.is_empty() {
    return Err(InputError::MissingBlock("routine call such as optimize(...)".to_string()));
  }

  let input = ScanInput { memory, molecule, variables, options, directives };

  for block in &input.options {
    for (_, value) in &block.entries {
      input.resolve(value)?;
    }
  }
  input.optimizer_config()?;

  log::debug!(
    "parsed molecule {} with {} atoms, {} option block(s), {} directive(s)",
    input.molecule.name.as_deref().unwrap_or("<unnamed>"),
    input.molecule.n_atoms(),
    input.options.len(),
    input.directives.len(),
  );
  Ok(input)
}

/// Parse a constraint string of whitespace-separated groups
/// `a b c d angle`, where the indices are 1-based.
pub fn parse_dihedrals(
  text: &str,
  n_atoms: usize,
) -> Result<Vec<DihedralConstraint>, InputError> {
  let tokens: Vec<&str> = text.split_whitespace().collect();
  if tokens.is_empty() {
    return Err(InputError::InvalidDihedral("constraint string is empty".to_string()));
  }
  if tokens.len() % 5 != 0 {
    return Err(InputError::InvalidDihedral(format!(
      "expected groups of four atom indices and an angle, got {} values",
      tokens.len()
    )));
  }

  let mut constraints = Vec::with_capacity(tokens.len() / 5);
  for group in tokens.chunks(5) {
    let mut atoms = [0usize; 4];
    for (slot, tok) in atoms.iter_mut().zip(group) {
      let idx = tok.parse::<usize>().map_err(|_| InputError::InvalidDihedral(
        format!("atom index {:?} is not a positive integer", tok)
      ))?;
      if idx == 0 || idx > n_atoms {
        return Err(InputError::AtomIndexOutOfRange { index: idx, n_atoms });
      }
      *slot = idx;
    }
    for a in 0..4 {
      for b in (a + 1)..4 {
        if atoms[a] == atoms[b] {
          return Err(InputError::InvalidDihedral(format!(
            "atom {} appears twice in one dihedral", atoms[a]
          )));
        }
      }
    }
    let angle_deg = group[4].parse::<f64>().map_err(|_| InputError::InvalidDihedral(
      format!("angle {:?} is not a number", group[4])
    ))?;
    if !angle_deg.is_finite() {
      return Err(InputError::InvalidDihedral(format!(
        "angle {:?} is not finite", group[4]
      )));
    }
    constraints.push(DihedralConstraint { atoms, angle_deg });
  }
  Ok(constraints)
}

/// Inverse of [`parse_dihedrals`]. Angles use the shortest representation
/// that parses back to the same value.
pub fn format_dihedrals(constraints: &[DihedralConstraint]) -> String {
  constraints
    .iter()
    .map(|c| format!(
      "{} {} {} {} {}",
      c.atoms[0], c.atoms[1], c.atoms[2], c.atoms[3], c.angle_deg
    ))
    .collect::<Vec<_>>()
    .join(" ")
}

/// Interpret unquoted option text as a bool, integer, float, or bare word.
pub fn classify_bare(text: &str) -> OptionValue {
  match text.to_lowercase().as_str() {
    "true" => return OptionValue::Bool(true),
    "false" => return OptionValue::Bool(false),
    _ => {}
  }
  if let Ok(n) = text.parse::<i64>() {
    return OptionValue::Int(n);
  }
  if let Ok(x) = text.parse::<f64>() {
    if x.is_finite() {
      return OptionValue::Float(x);
    }
  }
  OptionValue::Str(text.to_string())
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn syntax(line: usize, reason: &str) -> InputError {
  InputError::Syntax { line, reason: reason.to_string() }
}

fn is_identifier(s: &str) -> bool {
  let mut chars = s.chars();
  match chars.next() {
    Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
    _ => return false,
  }
  chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Cut `line` at the first `#` that is not inside a quoted string.
fn strip_comment(line: &str) -> &str {
  let mut quote: Option<char> = None;
  for (i, c) in line.char_indices() {
    match quote {
      Some(q) if c == q => quote = None,
      Some(_) => {}
      None if c == '"' || c == '\'' => quote = Some(c),
      None if c == '#' => return &line[..i],
      None => {}
    }
  }
  line
}

/// If `line` starts with `keyword` as a whole word, return what follows it.
fn keyword_rest<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
  let rest = line.strip_prefix(keyword)?;
  match rest.chars().next() {
    None => Some(rest),
    Some(c) if c.is_whitespace() || c == '{' => Some(rest.trim_start()),
    _ => None,
  }
}

/// Parse the tail of `molecule name {` or `set module {`, returning the
/// optional name.
fn block_header(
  line: usize,
  rest: &str,
  keyword: &str,
) -> Result<Option<String>, InputError> {
  let head = rest
    .trim_end()
    .strip_suffix('{')
    .ok_or_else(|| syntax(line, &format!("expected `{{` to open the {} block", keyword)))?
    .trim();
  if head.is_empty() {
    return Ok(None);
  }
  if !is_identifier(head) {
    return Err(syntax(line, &format!("invalid {} block name {:?}", keyword, head)));
  }
  Ok(Some(head.to_string()))
}

/// Collect the lines between the header at `start` and its closing `}`.
/// Returns the body and the index of the first line after the block.
fn block_body<'a>(
  lines: &'a [(usize, String)],
  start: usize,
  keyword: &str,
) -> Result<(&'a [(usize, String)], usize), InputError> {
  let close = lines[start + 1..]
    .iter()
    .position(|(_, l)| l == "}")
    .ok_or_else(|| syntax(lines[start].0, &format!("unterminated {} block", keyword)))?;
  let end = start + 1 + close;
  Ok((&lines[start + 1..end], end + 1))
}

fn parse_molecule(
  name: Option<String>,
  body: &[(usize, String)],
) -> Result<Molecule, InputError> {
  let mut symmetry = None;
  let mut units = Units::Angstrom;
  let mut no_reorient = false;
  let mut no_com = false;
  let mut charge_mult: Option<(i32, i64)> = None;
  let mut atoms = Vec::new();

  for (line, text) in body {
    let line = *line;
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let head = tokens[0].to_lowercase();

    match head.as_str() {
      "--" => return Err(syntax(line, "multi-fragment molecules are not supported")),
      "symmetry" => {
        if tokens.len() != 2 {
          return Err(syntax(line, "expected `symmetry <point group>`"));
        }
        symmetry = Some(tokens[1].to_lowercase());
        continue;
      }
      "units" | "unit" => {
        if tokens.len() != 2 {
          return Err(syntax(line, "expected `units angstrom` or `units bohr`"));
        }
        units = parse_units(line, tokens[1])?;
        continue;
      }
      "no_reorient" | "noreorient" if tokens.len() == 1 => {
        no_reorient = true;
        continue;
      }
      "no_com" | "nocom" if tokens.len() == 1 => {
        no_com = true;
        continue;
      }
      _ => {}
    }

    if tokens.len() == 2 {
      if let (Ok(c), Ok(m)) = (tokens[0].parse::<i32>(), tokens[1].parse::<i64>()) {
        if charge_mult.is_some() {
          return Err(syntax(line, "more than one charge/multiplicity line"));
        }
        if !atoms.is_empty() {
          return Err(syntax(line, "charge/multiplicity line must precede the atoms"));
        }
        charge_mult = Some((c, m));
        continue;
      }
    }

    if tokens.len() == 4 {
      let symbol = element_from_label(tokens[0]).ok_or_else(|| InputError::InvalidElement {
        line,
        label: tokens[0].to_string(),
      })?;
      let mut position = [0.0; 3];
      for (slot, tok) in position.iter_mut().zip(&tokens[1..]) {
        let x = tok.parse::<f64>()
          .map_err(|_| syntax(line, &format!("could not parse coordinate {:?}", tok)))?;
        if !x.is_finite() {
          return Err(syntax(line, &format!("coordinate {:?} is not finite", tok)));
        }
        *slot = x;
      }
      atoms.push(Atom { label: tokens[0].to_string(), symbol, position });
      continue;
    }

    if element_from_label(tokens[0]).is_some() && matches!(tokens.len(), 1 | 3 | 5 | 7) {
      return Err(syntax(line, "Z-matrix geometries are not supported"));
    }
    return Err(syntax(line, &format!("unrecognised molecule line {:?}", text)));
  }

  if atoms.is_empty() {
    return Err(InputError::InvalidValue {
      field: "molecule".to_string(),
      reason: "molecule block contains no atoms".to_string(),
    });
  }

  let mut molecule = Molecule {
    name,
    symmetry,
    charge: charge_mult.map(|(c, _)| c).unwrap_or(0),
    multiplicity: 1,
    units,
    no_reorient,
    no_com,
    atoms,
  };
  let electrons = molecule.electron_count();

  molecule.multiplicity = match charge_mult {
    Some((_, m)) => {
      if m < 1 {
        return Err(InputError::InvalidValue {
          field: "molecule.multiplicity".to_string(),
          reason: format!("must be >= 1, got {}", m),
        });
      }
      u32::try_from(m).map_err(|_| InputError::InvalidValue {
        field: "molecule.multiplicity".to_string(),
        reason: format!("must be at most {}, got {}", u32::MAX, m),
      })?
    }
    None if electrons % 2 == 0 => 1,
    None => 2,
  };

  let m = molecule.multiplicity as i64;
  if electrons < 0 || m > electrons + 1 || (electrons % 2 == 0) != (m % 2 == 1) {
    return Err(InputError::InconsistentSpin {
      electrons,
      multiplicity: molecule.multiplicity,
    });
  }

  Ok(molecule)
}

fn parse_units(line: usize, word: &str) -> Result<Units, InputError> {
  match word.to_lowercase().as_str() {
    "angstrom" | "ang" | "a" => Ok(Units::Angstrom),
    "bohr" | "au" | "a.u." => Ok(Units::Bohr),
    other => Err(syntax(line, &format!("unrecognised units {:?}", other))),
  }
}

/// Parse one `key value` or `key = value` line from a `set` block.
fn parse_option_line(
  line: usize,
  text: &str,
) -> Result<(String, OptionValue), InputError> {
  let (key, rest) = match text.find(|c: char| c.is_whitespace() || c == '=') {
    Some(i) => (&text[..i], text[i..].trim_start()),
    None => (text, ""),
  };
  if !is_identifier(key) {
    return Err(syntax(line, &format!("invalid option name {:?}", key)));
  }
  let rest = rest.strip_prefix('=').unwrap_or(rest).trim();
  if rest.is_empty() {
    return Err(syntax(line, &format!("missing value for option {}", key)));
  }
  Ok((key.to_lowercase(), parse_value(line, rest)?))
}

/// `set key value` or `set module key value`.
fn parse_set_line(
  line: usize,
  rest: &str,
) -> Result<(Option<String>, (String, OptionValue)), InputError> {
  let tokens: Vec<&str> = rest.split_whitespace().collect();
  match tokens.len() {
    0 | 1 => Err(syntax(line, "expected `set [module] <key> <value>`")),
    2 => Ok((None, parse_option_line(line, rest)?)),
    _ => {
      if !is_identifier(tokens[0]) {
        return Err(syntax(line, &format!("invalid module name {:?}", tokens[0])));
      }
      let tail = rest[tokens[0].len()..].trim_start();
      Ok((Some(tokens[0].to_lowercase()), parse_option_line(line, tail)?))
    }
  }
}

fn parse_value(line: usize, text: &str) -> Result<OptionValue, InputError> {
  if let Some(name) = text.strip_prefix('$') {
    if !is_identifier(name) {
      return Err(syntax(line, &format!("invalid variable reference {:?}", text)));
    }
    return Ok(OptionValue::Variable(name.to_string()));
  }
  if let Some(inner) = unquote(text) {
    return Ok(OptionValue::Str(inner.to_string()));
  }
  let opening = text.strip_prefix('(').map(str::trim_start).unwrap_or(text);
  if opening.starts_with('"') || opening.starts_with('\'') {
    return Err(syntax(line, &format!("unterminated string {}", text)));
  }
  Ok(classify_bare(text))
}

/// Options and variables hold for the whole input, not per routine call.
fn after_routine(line: usize, what: &str) -> InputError {
  syntax(line, &format!(
    "{} statements after a routine call are not supported; move them before the first call",
    what
  ))
}

/// Strips quotes, also accepting the parenthesised form `("...")`.
fn unquote(text: &str) -> Option<&str> {
  if let Some(inner) = text.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
    return unquote_plain(inner.trim());
  }
  unquote_plain(text)
}

fn unquote_plain(text: &str) -> Option<&str> {
  for q in ['"', '\''] {
    if text.len() >= 2 && text.starts_with(q) && text.ends_with(q) {
      let inner = &text[1..text.len() - 1];
      if !inner.contains(q) {
        return Some(inner);
      }
    }
  }
  None
}

fn merge_options(
  options: &mut Vec<OptionBlock>,
  module: Option<String>,
  entries: Vec<(String, OptionValue)>,
) {
  let idx = match options.iter().position(|b| b.module == module) {
    Some(i) => i,
    None => {
      options.push(OptionBlock { module, entries: Vec::new() });
      options.len() - 1
    }
  };
  let block = &mut options[idx];
  for (key, value) in entries {
    match block.entries.iter().position(|(k, _)| *k == key) {
      Some(p) => block.entries[p].1 = value,
      None => block.entries.push((key, value)),
    }
  }
}

/// `name = "text"`. Returns `Ok(None)` when the line is not an assignment.
fn parse_variable(
  line: usize,
  text: &str,
) -> Result<Option<(String, String)>, InputError> {
  let (lhs, rhs) = match text.split_once('=') {
    Some(parts) => parts,
    None => return Ok(None),
  };
  let lhs = lhs.trim();
  let rhs = rhs.trim();
  if !is_identifier(lhs) {
    return Ok(None);
  }
  match unquote(rhs) {
    Some(inner) => Ok(Some((lhs.to_string(), inner.to_string()))),
    None => Err(syntax(line, &format!(
      "only quoted string variables are supported, got `{} = {}`", lhs, rhs
    ))),
  }
}

/// `routine('level', key=value, ...)`.
fn parse_directive(line: usize, text: &str) -> Result<Directive, InputError> {
  let open = text.find('(')
    .ok_or_else(|| syntax(line, &format!("unrecognised statement {:?}", text)))?;
  let name = text[..open].trim();
  let args = text[open + 1..]
    .strip_suffix(')')
    .ok_or_else(|| syntax(line, "expected `)` at the end of the call"))?;

  let routine = Routine::from_name(name)
    .ok_or_else(|| syntax(line, &format!("unsupported routine {:?}", name)))?;

  let mut parts = split_args(args).into_iter();
  let first = parts.next().unwrap_or_default();
  let level = unquote(&first)
    .ok_or_else(|| syntax(line, &format!(
      "{}() needs a quoted level of theory as its first argument", name
    )))?
    .to_string();
  if level.is_empty() {
    return Err(InputError::InvalidValue {
      field: format!("{}()", name),
      reason: "level of theory must not be empty".to_string(),
    });
  }

  let extra_args: Vec<String> = parts.filter(|a| !a.is_empty()).collect();
  for arg in &extra_args {
    if !arg.contains('=') {
      return Err(syntax(line, &format!(
        "positional argument {:?} after the level of theory", arg
      )));
    }
  }

  Ok(Directive { routine, name: name.to_string(), level, extra_args })
}

/// Split call arguments on commas outside quotes and brackets.
fn split_args(args: &str) -> Vec<String> {
  let mut out = Vec::new();
  let mut current = String::new();
  let mut quote: Option<char> = None;
  let mut depth = 0i32;
  for c in args.chars() {
    match quote {
      Some(q) => {
        if c == q {
          quote = None;
        }
        current.push(c);
      }
      None => match c {
        '"' | '\'' => { quote = Some(c); current.push(c); }
        '(' | '[' | '{' => { depth += 1; current.push(c); }
        ')' | ']' | '}' => { depth -= 1; current.push(c); }
        ',' if depth == 0 => out.push(std::mem::take(&mut current).trim().to_string()),
        _ => current.push(c),
      },
    }
  }
  out.push(current.trim().to_string());
  out
}

fn expect_int(field: &str, value: &OptionValue) -> Result<i64, InputError> {
  match value {
    OptionValue::Int(n) => Ok(*n),
    _ => Err(InputError::InvalidValue {
      field: field.to_string(),
      reason: "expected an integer".to_string(),
    }),
  }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
