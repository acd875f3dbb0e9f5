/// All 118 known element symbols in title case, indexed by atomic number (1-based).
const ELEMENTS: &[&str] = &[
  "H",  "He", "Li", "Be", "B",  "C",  "N",  "O",  "F",  "Ne",
  "Na", "Mg", "Al", "Si", "P",  "S",  "Cl", "Ar", "K",  "Ca",
  "Sc", "Ti", "V",  "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn",
  "Ga", "Ge", "As", "Se", "Br", "Kr", "Rb", "Sr", "Y",  "Zr",
  "Nb", "Mo", "Tc", "Ru", "Rh", "Pd", "Ag", "Cd", "In", "Sn",
  "Sb", "Te", "I",  "Xe", "Cs", "Ba", "La", "Ce", "Pr", "Nd",
  "Pm", "Sm", "Eu", "Gd", "Tb", "Dy", "Ho", "Er", "Tm", "Yb",
  "Lu", "Hf", "Ta", "W",  "Re", "Os", "Ir", "Pt", "Au", "Hg",
  "Tl", "Pb", "Bi", "Po", "At", "Rn", "Fr", "Ra", "Ac", "Th",
  "Pa", "U",  "Np", "Pu", "Am", "Cm", "Bk", "Cf", "Es", "Fm",
  "Md", "No", "Lr", "Rf", "Db", "Sg", "Bh", "Hs", "Mt", "Ds",
  "Rg", "Cn", "Nh", "Fl", "Mc", "Lv", "Ts", "Og",
];

/// Single-bond covalent radii in Angstrom for H through Kr (Cordero et al., 2008).
const COVALENT_RADII: &[f64] = &[
  0.31, 0.28, 1.28, 0.96, 0.84, 0.76, 0.71, 0.66, 0.57, 0.58,
  1.66, 1.41, 1.21, 1.11, 1.07, 1.05, 1.02, 1.06, 2.03, 1.76,
  1.70, 1.60, 1.53, 1.39, 1.39, 1.32, 1.26, 1.24, 1.32, 1.22,
  1.22, 1.20, 1.19, 1.20, 1.20, 1.16,
];

/// Used for elements past Kr.
const FALLBACK_RADIUS: f64 = 1.50;

/// Normalise `sym` to title case and validate against the periodic table.
pub fn normalize_element(sym: &str) -> Option<String> {
  let mut chars = sym.chars();
  let normalized = match chars.next() {
    Some(c) => {
      let upper: String = c.to_uppercase().collect();
      upper + &chars.as_str().to_lowercase()
    }
    None => return None,
  };
  if ELEMENTS.contains(&normalized.as_str()) {
    Some(normalized)
  } else {
    None
  }
}

/// Resolve an atom label such as `C`, `C12` or `h_methyl` to its element
/// symbol. Everything from the first digit or underscore on is a user tag.
pub fn element_from_label(label: &str) -> Option<String> {
  let end = label
    .find(|c: char| c.is_ascii_digit() || c == '_')
    .unwrap_or(label.len());
  normalize_element(&label[..end])
}

/// Atomic number of a normalised element symbol.
pub fn atomic_number(symbol: &str) -> Option<usize> {
  ELEMENTS.iter().position(|e| *e == symbol).map(|i| i + 1)
}

pub fn covalent_radius(symbol: &str) -> f64 {
  match atomic_number(symbol) {
    Some(z) if z <= COVALENT_RADII.len() => COVALENT_RADII[z - 1],
    _ => {
      log::warn!("no covalent radius tabulated for {}, using {:.2} Å", symbol, FALLBACK_RADIUS);
      FALLBACK_RADIUS
    }
  }
}
