//! Operator-defined command aliases.

use std::collections::BTreeMap;

use anyhow::{Result, bail};

/// Alias name to command template. An alias expands to its template
/// followed by whatever arguments were typed after the alias name.
#[derive(Debug, Default, Clone)]
pub struct AliasTable {
    aliases: BTreeMap<String, String>,
}

impl AliasTable {
    pub fn new(aliases: BTreeMap<String, String>) -> Self {
        Self { aliases }
    }

    /// Define or replace `name`. Names of built-in commands are refused.
    pub fn define(&mut self, name: &str, template: &str, builtins: &[&str]) -> Result<()> {
        if !self.aliases.contains_key(name) && builtins.contains(&name) {
            bail!("Name '{}' is already being used by built-in command", name);
        }
        self.aliases.insert(name.to_string(), template.trim().to_string());
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.aliases.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.aliases.get(name).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.aliases.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /// Expand `name args` into the aliased command line.
    pub fn expand(&self, name: &str, args: &str) -> Option<String> {
        let template = self.get(name)?;
        let args = args.trim();
        Some(if args.is_empty() {
            template.to_string()
        } else {
            format!("{} {}", template, args)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUILTINS: &[&str] = &["move", "ls"];

    #[test]
    fn test_expand_appends_args() {
        let mut table = AliasTable::default();
        table.define("up", "move z", BUILTINS).unwrap();
        assert_eq!(table.expand("up", " 10 ").as_deref(), Some("move z 10"));
        assert_eq!(table.expand("up", "").as_deref(), Some("move z"));
        assert_eq!(table.expand("down", "1"), None);
    }

    #[test]
    fn test_builtin_names_refused() {
        let mut table = AliasTable::default();
        assert!(table.define("ls", "M20", BUILTINS).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove() {
        let mut table = AliasTable::new(BTreeMap::from([("home".to_string(), "G28".to_string())]));
        assert!(table.remove("home"));
        assert!(!table.remove("home"));
    }
}
