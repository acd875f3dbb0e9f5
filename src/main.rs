mod elements;
mod export;
mod geometry;
mod input;
mod scan;
mod writer;

use std::path::Path;
use std::process;

use input::{parse_input, ScanInput};

const USAGE: &str = "usage: torscan <check|format|xyz|json|measure|scan> <path>";

/// Core CLI logic. Takes the arguments (excluding argv[0]) and returns either
/// the text to print on stdout, or the error message to print on stderr
/// (without the "error: " prefix, which `main` adds).
fn run(args: &[String]) -> Result<String, String> {
  if args.len() != 2 {
    return Err(USAGE.to_string());
  }
  let path = Path::new(&args[1]);

  match args[0].as_str() {
    "check" => load(path).map(|input| summary(&input)),
    "format" => load(path).map(|input| writer::write_input(&input)),
    "xyz" => load(path).map(|input| export::to_xyz(&input.molecule, None)),
    "json" => {
      let input = load(path)?;
      let doc = export::to_qcschema(&input).map_err(|e| e.to_string())?;
      serde_json::to_string_pretty(&doc).map_err(|e| e.to_string())
    }
    "measure" => measure(&load(path)?),
    "scan" => {
      let config = scan::load_scan_config(path).map_err(|e| e.to_string())?;
      let written = scan::write_scan(&config).map_err(|e| e.to_string())?;
      Ok(format!(
        "Wrote {} input files to {}",
        written.len(), config.output_dir.display()
      ))
    }
    other => Err(format!("unknown command {:?}; {}", other, USAGE)),
  }
}

fn load(path: &Path) -> Result<ScanInput, String> {
  parse_input(path).map_err(|e| e.to_string())
}

fn summary(input: &ScanInput) -> String {
  let mol = &input.molecule;
  let (routine, method, basis) = match input.directives.first() {
    Some(d) => (d.routine.as_str(), d.method(), d.basis().unwrap_or_else(|| "-".to_string())),
    None => ("-", "-".to_string(), "-".to_string()),
  };
  let fixed = input.optimizer_config()
    .map(|c| c.fixed_dihedrals.len())
    .unwrap_or(0);
  format!(
    "Parsed: molecule={}, atoms={}, charge={}, multiplicity={}, routine={}, method={}, basis={}, fixed_dihedrals={}",
    mol.name.as_deref().unwrap_or("-"), mol.n_atoms(), mol.charge, mol.multiplicity,
    routine, method, basis, fixed
  )
}

fn measure(input: &ScanInput) -> Result<String, String> {
  let config = input.optimizer_config().map_err(|e| e.to_string())?;
  if config.fixed_dihedrals.is_empty() {
    return Err("input has no fixed_dihedral constraints".to_string());
  }
  let mut lines = Vec::with_capacity(config.fixed_dihedrals.len());
  for c in &config.fixed_dihedrals {
    let current = geometry::measure_dihedral(&input.molecule, c).map_err(|e| e.to_string())?;
    lines.push(format!(
      "{}-{}-{}-{}: current={:.4}, target={:.4}",
      c.atoms[0], c.atoms[1], c.atoms[2], c.atoms[3], current, c.angle_deg
    ));
  }
  Ok(lines.join("\n"))
}

fn main() {
  env_logger::init();

  let args: Vec<String> = std::env::args().skip(1).collect();
  match run(&args) {
    Ok(msg) => println!("{}", msg.trim_end()),
    Err(e) => {
      eprintln!("error: {}", e);
      process::exit(1);
    }
  }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
