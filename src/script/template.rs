//! Operator-supplied script templates, rendered with `minijinja`.
//!
//! Templates are Jinja: `{{ App.Name }}`, `{{ DefaultScript }}`,
//! `{% if SaveRelease %}...{% endif %}`. Syntax errors are reported when the
//! template is loaded. Rendering is strict, so a name with no value for the
//! script kind being rendered fails instead of expanding to nothing.

use std::collections::BTreeMap;

use camino::Utf8Path;
use minijinja::{AutoEscape, Environment, UndefinedBehavior, Value};

use super::ScriptError;
use crate::config::{App, read_to_string_ambient};

/// Values available to a template render.
#[derive(Clone, Debug, Default)]
pub struct TemplateVars(BTreeMap<String, Value>);

impl TemplateVars {
    /// Sets `name` to `value`, replacing any previous value.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.0.insert(name.to_owned(), value.into());
    }

    /// Sets `name` to a map so templates can write `{{ name.key }}`.
    pub fn set_map(&mut self, name: &str, fields: &BTreeMap<&str, Value>) {
        self.0.insert(name.to_owned(), Value::from_serialize(fields));
    }

    /// Looks up a variable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }
}

/// A loaded template with the path it came from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScriptTemplate {
    origin: String,
    text: String,
}

impl ScriptTemplate {
    /// Wraps template text after checking that it compiles; `origin` names
    /// it in errors.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::Syntax`] when the text is not a valid template.
    pub fn new(origin: impl Into<String>, text: impl Into<String>) -> Result<Self, ScriptError> {
        let template = Self {
            origin: origin.into(),
            text: text.into(),
        };
        check_syntax(&template.origin, &template.text).map_err(|err| ScriptError::Syntax {
            template: template.origin.clone(),
            message: err.to_string(),
        })?;
        Ok(template)
    }

    /// Reads a template file.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::Read`] when the file cannot be read, plus the
    /// errors of [`ScriptTemplate::new`].
    pub fn load(path: &Utf8Path) -> Result<Self, ScriptError> {
        let text = read_to_string_ambient(path).map_err(|err| ScriptError::Read {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::new(path.as_str(), text)
    }

    /// Where the template came from.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Renders the template against `vars`.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::Render`] when the template references a
    /// variable with no value for this render, or an expression fails.
    pub fn render(&self, vars: &TemplateVars) -> Result<String, ScriptError> {
        let env = environment();
        let render_error = |err: minijinja::Error| ScriptError::Render {
            template: self.origin.clone(),
            message: err.to_string(),
        };
        let template = env
            .template_from_named_str(&self.origin, &self.text)
            .map_err(render_error)?;
        template.render(&vars.0).map_err(render_error)
    }
}

fn check_syntax(origin: &str, text: &str) -> Result<(), minijinja::Error> {
    let env = environment();
    env.template_from_named_str(origin, text)?;
    Ok(())
}

fn environment<'source>() -> Environment<'source> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    env.set_auto_escape_callback(|_| AutoEscape::None);
    env
}

/// Operator overrides for the deploy, restart, and migration scripts,
/// loaded before any host is contacted.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScriptTemplates {
    /// Replaces the deploy script.
    pub deploy: Option<ScriptTemplate>,
    /// Replaces the restart script.
    pub restart: Option<ScriptTemplate>,
    /// Replaces the migration script.
    pub migration: Option<ScriptTemplate>,
}

impl ScriptTemplates {
    /// Loads every override the app declares.
    ///
    /// # Errors
    ///
    /// Returns the first read or parse failure.
    pub fn load(app: &App) -> Result<Self, ScriptError> {
        Ok(Self {
            deploy: load_optional(app.deploy_script.as_deref())?,
            restart: load_optional(app.restart_script.as_deref())?,
            migration: load_optional(app.migration_script.as_deref())?,
        })
    }
}

fn load_optional(path: Option<&Utf8Path>) -> Result<Option<ScriptTemplate>, ScriptError> {
    path.map(ScriptTemplate::load).transpose()
}
