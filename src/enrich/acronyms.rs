//! Acronym expansion for fuzzy blocking
//!
//! Given a domain dictionary (`MI` → `Myocardial Infarction`, …),
//! expands a query term set before full-text search so an acronym also
//! matches records spelling the expansion out.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct AcronymExpander {
    /// Lower-cased acronym → expansions.
    map: HashMap<String, Vec<String>>,
}

impl AcronymExpander {
    pub fn new(dictionary: impl IntoIterator<Item = (String, Vec<String>)>) -> Self {
        let map = dictionary
            .into_iter()
            .map(|(acronym, expansions)| (acronym.to_lowercase(), expansions))
            .collect();
        Self { map }
    }

    /// Expansions registered for a term, if any.
    pub fn expansions(&self, term: &str) -> Option<&[String]> {
        self.map.get(&term.to_lowercase()).map(Vec::as_slice)
    }

    /// Expand a term set: the original terms, followed by the tokens of
    /// every expansion, deduplicated, original order preserved.
    pub fn expand_terms(&self, terms: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(terms.len());
        let mut push = |token: String, out: &mut Vec<String>| {
            if !token.is_empty() && !out.contains(&token) {
                out.push(token);
            }
        };
        for term in terms {
            push(term.to_lowercase(), &mut out);
        }
        for term in terms {
            if let Some(expansions) = self.expansions(term) {
                for expansion in expansions {
                    for token in expansion.split_whitespace() {
                        push(token.to_lowercase(), &mut out);
                    }
                }
            }
        }
        out
    }
}
