//! User ids and display-name resolution.
//!
//! Student ids embed a slug of the student's name (`student-ana-k3x9q1`), so a
//! name can be recovered from an id when an event carries no explicit name.
//! Decoding is best effort only; events published by this crate always carry
//! `fromName`.

use std::collections::HashMap;

use rand::Rng;

use super::models::User;

const TOKEN_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub const TEACHER_PREFIX: &str = "teacher-";
pub const STUDENT_PREFIX: &str = "student-";

/// Lowercase base-36 token
pub fn random_token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

/// Lower-cases the trimmed name and replaces anything outside `[a-z0-9]` with `-`.
pub fn slugify(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' })
        .collect()
}

pub fn teacher_id() -> String {
    format!("{}{}", TEACHER_PREFIX, random_token(9))
}

pub fn student_id(name: &str) -> String {
    format!("{}{}-{}", STUDENT_PREFIX, slugify(name), random_token(6))
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Recovers a display name from a user id, if the id embeds one.
pub fn decode_display_name(user_id: &str) -> Option<String> {
    if user_id.starts_with(TEACHER_PREFIX) {
        return Some("Teacher".to_string());
    }

    let rest = user_id.strip_prefix(STUDENT_PREFIX)?;
    let parts: Vec<&str> = rest.split('-').collect();
    if parts.len() < 2 {
        return None;
    }

    // Last part is the random token
    let words: Vec<String> = parts[..parts.len() - 1]
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| title_case(p))
        .collect();

    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

/// Session-scoped user id → display name cache
#[derive(Debug, Default)]
pub struct DisplayNames {
    names: HashMap<String, String>,
}

impl DisplayNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, user_id: &str, name: &str) {
        self.names.insert(user_id.to_string(), name.to_string());
    }

    pub fn get(&self, user_id: &str) -> Option<&str> {
        self.names.get(user_id).map(String::as_str)
    }

    pub fn remove(&mut self, user_id: &str) {
        self.names.remove(user_id);
    }

    pub fn clear(&mut self) {
        self.names.clear();
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Cached name, else the local user's name, else the name decoded from the
    /// id, else the raw id. The result is cached.
    pub fn resolve(&mut self, user_id: &str, local: &User) -> String {
        if let Some(name) = self.names.get(user_id) {
            return name.clone();
        }

        let name = if user_id == local.id {
            local.name.clone()
        } else {
            decode_display_name(user_id).unwrap_or_else(|| user_id.to_string())
        };

        self.names.insert(user_id.to_string(), name.clone());
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classroom::models::Role;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Ana"), "ana");
        assert_eq!(slugify(" John Doe "), "john-doe");
        assert_eq!(slugify("Zoë!"), "zo--");
    }

    #[test]
    fn test_random_token_alphabet() {
        let token = random_token(64);
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_decode_student_name_independent_of_suffix() {
        for _ in 0..20 {
            let id = student_id("Ana");
            assert_eq!(decode_display_name(&id).as_deref(), Some("Ana"));
        }
        assert_eq!(
            decode_display_name("student-john-doe-abc123").as_deref(),
            Some("John Doe")
        );
    }

    #[test]
    fn test_decode_teacher_and_unknown() {
        assert_eq!(decode_display_name("teacher-abc123xyz").as_deref(), Some("Teacher"));
        assert_eq!(decode_display_name("student-abc123"), None);
        assert_eq!(decode_display_name("user-42"), None);
    }

    #[test]
    fn test_resolve_prefers_cache_then_local() {
        let local = User {
            id: "student-ana-aaaaaa".to_string(),
            name: "Ana María".to_string(),
            role: Role::Student,
        };
        let mut names = DisplayNames::new();

        assert_eq!(names.resolve(&local.id, &local), "Ana María");
        assert_eq!(names.resolve("student-bob-smith-zz99zz", &local), "Bob Smith");
        assert_eq!(names.resolve("device-7", &local), "device-7");
        assert_eq!(names.len(), 3);

        names.register("student-bob-smith-zz99zz", "Robert");
        assert_eq!(names.resolve("student-bob-smith-zz99zz", &local), "Robert");

        names.clear();
        assert!(names.is_empty());
    }
}
