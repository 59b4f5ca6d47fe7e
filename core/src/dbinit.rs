//! dbinit script builder
//!
//! The server is told which modules to load, and which procedure to call
//! once they are loaded, through a single inline expression passed with
//! `--dbinit`.

use serde::{Deserialize, Serialize};

use crate::{HarnessError, HarnessResult};

/// Modules loaded by the module-loading smoke scenario.
pub const DEFAULT_MODULES: &[&str] = &["sql_server", "mapi", "monettime"];

/// Procedure started after all modules are loaded.
pub const DEFAULT_STARTUP: &str = "mapi_start";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbInit {
    pub modules: Vec<String>,
    pub startup: String,
}

impl Default for DbInit {
    fn default() -> Self {
        Self {
            modules: DEFAULT_MODULES.iter().map(|m| m.to_string()).collect(),
            startup: DEFAULT_STARTUP.to_string(),
        }
    }
}

impl DbInit {
    pub fn new<I, S>(modules: I, startup: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            modules: modules.into_iter().map(Into::into).collect(),
            startup: startup.into(),
        }
    }

    /// Render the script, e.g. `module(sql_server);module(mapi); mapi_start();`.
    ///
    /// Module loads are concatenated without separators; the startup call is
    /// preceded by a single space.
    pub fn render(&self) -> String {
        let mut script = String::new();
        for module in &self.modules {
            script.push_str("module(");
            script.push_str(module);
            script.push_str(");");
        }
        script.push(' ');
        script.push_str(&self.startup);
        script.push_str("();");
        script
    }

    /// Reject names that would break out of the rendered expression.
    pub fn validate(&self) -> HarnessResult<()> {
        if self.modules.is_empty() {
            return Err(HarnessError::InvalidInput(
                "dbinit needs at least one module".into(),
            ));
        }
        for name in self.modules.iter().chain(std::iter::once(&self.startup)) {
            if !is_identifier(name) {
                return Err(HarnessError::InvalidInput(format!(
                    "not a valid module or procedure name: {name:?}"
                )));
            }
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_script() {
        assert_eq!(
            DbInit::default().render(),
            "module(sql_server);module(mapi);module(monettime); mapi_start();"
        );
    }

    #[test]
    fn test_custom_modules() {
        let init = DbInit::new(["sql_server"], "sql_start");
        assert_eq!(init.render(), "module(sql_server); sql_start();");
    }

    #[test]
    fn test_validate_rejects_injection() {
        let init = DbInit::new(["mapi); quit("], "mapi_start");
        assert!(matches!(
            init.validate(),
            Err(HarnessError::InvalidInput(_))
        ));

        let init = DbInit::new(["mapi"], "1start");
        assert!(init.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_module_list() {
        let init = DbInit::new(Vec::<String>::new(), "mapi_start");
        assert!(init.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_default() {
        assert!(DbInit::default().validate().is_ok());
    }
}
