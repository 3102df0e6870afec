use std::collections::HashMap;
use once_cell::sync::Lazy;

/// Two-letter code of a Brazilian federative unit (UF)
pub type StateCode = &'static str;

/// A Brazilian state or the Federal District
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrazilianState {
    pub code: StateCode,
    /// Name as it appears in the state boundary layer (`ESTADO`)
    pub name: &'static str,
    /// Contracted preposition used before the name ("no", "na" or "em")
    pub preposition: &'static str,
}

impl BrazilianState {
    pub const fn new(code: StateCode, name: &'static str, preposition: &'static str) -> Self {
        Self {
            code,
            name,
            preposition,
        }
    }

    /// "no Piauí", "na Bahia", "em Goiás"
    pub fn locative(&self) -> String {
        format!("{} {}", self.preposition, self.name)
    }
}

/// All federative units, keyed by UF code
pub static BRAZILIAN_STATES: Lazy<HashMap<StateCode, BrazilianState>> = Lazy::new(|| {
    let states = vec![
        BrazilianState::new("AC", "Acre", "no"),
        BrazilianState::new("AL", "Alagoas", "em"),
        BrazilianState::new("AP", "Amapá", "no"),
        BrazilianState::new("AM", "Amazonas", "no"),
        BrazilianState::new("BA", "Bahia", "na"),
        BrazilianState::new("CE", "Ceará", "no"),
        BrazilianState::new("DF", "Distrito Federal", "no"),
        BrazilianState::new("ES", "Espírito Santo", "no"),
        BrazilianState::new("GO", "Goiás", "em"),
        BrazilianState::new("MA", "Maranhão", "no"),
        BrazilianState::new("MT", "Mato Grosso", "em"),
        BrazilianState::new("MS", "Mato Grosso do Sul", "em"),
        BrazilianState::new("MG", "Minas Gerais", "em"),
        BrazilianState::new("PA", "Pará", "no"),
        BrazilianState::new("PB", "Paraíba", "na"),
        BrazilianState::new("PR", "Paraná", "no"),
        BrazilianState::new("PE", "Pernambuco", "em"),
        BrazilianState::new("PI", "Piauí", "no"),
        BrazilianState::new("RJ", "Rio de Janeiro", "no"),
        BrazilianState::new("RN", "Rio Grande do Norte", "no"),
        BrazilianState::new("RS", "Rio Grande do Sul", "no"),
        BrazilianState::new("RO", "Rondônia", "em"),
        BrazilianState::new("RR", "Roraima", "em"),
        BrazilianState::new("SC", "Santa Catarina", "em"),
        BrazilianState::new("SP", "São Paulo", "em"),
        BrazilianState::new("SE", "Sergipe", "em"),
        BrazilianState::new("TO", "Tocantins", "no"),
    ];

    states.into_iter().map(|s| (s.code, s)).collect()
});

/// Look up a state by UF code, ignoring case and padding
pub fn get_state(code: &str) -> Option<&'static BrazilianState> {
    BRAZILIAN_STATES.get(code.trim().to_ascii_uppercase().as_str())
}

/// List all UF codes, sorted
pub fn list_states() -> Vec<StateCode> {
    let mut codes: Vec<_> = BRAZILIAN_STATES.keys().copied().collect();
    codes.sort();
    codes
}

impl std::fmt::Display for BrazilianState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.code)
    }
}
