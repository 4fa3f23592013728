//! Compiled templates and the render outcome.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tera::{Context, Tera};
use tracing::trace;

use tether_core::{Dependency, TemplateConfig, Values};

use crate::error::RenderError;
use crate::functions::Scope;

/// Result of rendering one template against a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Every dependency the template touched had a value.
    Ready {
        contents: String,
        dependencies: BTreeSet<Dependency>,
    },
    /// At least one touched dependency has not been received yet.
    NotReady {
        dependencies: BTreeSet<Dependency>,
        missing: BTreeSet<Dependency>,
    },
}

impl RenderOutcome {
    /// Every dependency the render touched, received or not.
    pub fn dependencies(&self) -> &BTreeSet<Dependency> {
        match self {
            RenderOutcome::Ready { dependencies, .. }
            | RenderOutcome::NotReady { dependencies, .. } => dependencies,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, RenderOutcome::Ready { .. })
    }
}

/// A parsed template, ready to render any number of times.
///
/// Parsing happens once at construction so syntax errors surface when the
/// configuration is loaded rather than on the first change.
#[derive(Clone)]
pub struct Template {
    name: String,
    tera: Tera,
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template").field("name", &self.name).finish()
    }
}

impl Template {
    /// Compile the template described by `config`, reading `source` from disk
    /// when the contents are not inline.
    pub fn compile(config: &TemplateConfig) -> Result<Self, RenderError> {
        let contents = match (&config.contents, &config.source) {
            (Some(contents), _) => contents.clone(),
            (None, Some(source)) => read_source(source)?,
            (None, None) => {
                return Err(RenderError::MissingSource { id: config.id() });
            }
        };
        Self::from_contents(config.id(), &contents)
    }

    pub fn from_contents(name: impl Into<String>, contents: &str) -> Result<Self, RenderError> {
        let name = name.into();
        let mut tera = Tera::default();
        // Output is arbitrary config text, never HTML.
        tera.autoescape_on(vec![]);
        tera.add_raw_template(&name, contents)?;
        Ok(Self { name, tera })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Render against `values`.
    ///
    /// A render that touched an unknown dependency is `NotReady` even when
    /// Tera itself failed, because placeholder values can legitimately break
    /// expressions such as `s[0].address` after
    /// `{% set s = service(name="web") %}`. A failure with every value present
    /// is [`RenderError::Failed`] and still reports what was touched.
    pub fn render(&self, values: Arc<Values>) -> Result<RenderOutcome, RenderError> {
        let scope = Scope::new(values);
        let mut tera = self.tera.clone();
        scope.register(&mut tera);

        let rendered = tera.render(&self.name, &Context::new());
        let recorded = scope.recorded();

        if !recorded.missing.is_empty() {
            if let Err(e) = &rendered {
                trace!(template = %self.name, error = %e, "render failed on placeholder values");
            }
            return Ok(RenderOutcome::NotReady {
                dependencies: recorded.used,
                missing: recorded.missing,
            });
        }

        match rendered {
            Ok(contents) => Ok(RenderOutcome::Ready {
                contents,
                dependencies: recorded.used,
            }),
            Err(source) => Err(RenderError::Failed {
                name: self.name.clone(),
                dependencies: recorded.used,
                source,
            }),
        }
    }
}

fn read_source(path: &Path) -> Result<String, RenderError> {
    std::fs::read_to_string(path).map_err(|source| RenderError::Io {
        path: PathBuf::from(path),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::DependencyValue;

    const FIRST_WEB_ADDRESS: &str =
        r#"{% set s = service(name="web") %}{{ s[0].address }}"#;

    fn values(entries: Vec<(Dependency, DependencyValue)>) -> Arc<Values> {
        Arc::new(entries.into_iter().collect())
    }

    #[test]
    fn static_template_is_ready_with_no_dependencies() {
        let template = Template::from_contents("static", "hello").expect("compile");
        let outcome = template.render(values(vec![])).expect("render");
        assert_eq!(
            outcome,
            RenderOutcome::Ready {
                contents: "hello".into(),
                dependencies: BTreeSet::new(),
            }
        );
    }

    #[test]
    fn unknown_dependency_makes_render_not_ready() {
        let template =
            Template::from_contents("t", r#"{{ key(path="a") }}-{{ key(path="b") }}"#)
                .expect("compile");
        let outcome = template
            .render(values(vec![(
                Dependency::key("a"),
                DependencyValue::Key(Some("1".into())),
            )]))
            .expect("render");

        match outcome {
            RenderOutcome::NotReady {
                dependencies,
                missing,
            } => {
                assert_eq!(dependencies.len(), 2);
                assert_eq!(missing, BTreeSet::from([Dependency::key("b")]));
            }
            other => panic!("expected NotReady, got {other:?}"),
        }
    }

    #[test]
    fn placeholder_breakage_is_not_an_error() {
        let template = Template::from_contents("t", FIRST_WEB_ADDRESS).expect("compile");
        let outcome = template.render(values(vec![])).expect("render");
        assert!(!outcome.is_ready());
        assert_eq!(
            outcome.dependencies(),
            &BTreeSet::from([Dependency::service("web", None)])
        );
    }

    #[test]
    fn broken_expression_with_known_values_is_an_error() {
        let template = Template::from_contents("t", FIRST_WEB_ADDRESS).expect("compile");
        let err = template
            .render(values(vec![(
                Dependency::service("web", None),
                DependencyValue::Service(vec![]),
            )]))
            .unwrap_err();
        assert!(matches!(err, RenderError::Failed { .. }), "got: {err}");
        assert_eq!(
            err.dependencies(),
            Some(&BTreeSet::from([Dependency::service("web", None)]))
        );
    }

    #[test]
    fn syntax_error_fails_at_compile() {
        assert!(Template::from_contents("t", "{{ unclosed").is_err());
    }

    #[test]
    fn output_is_not_html_escaped() {
        let template = Template::from_contents("t", r#"{{ key(path="x") }}"#).expect("compile");
        let outcome = template
            .render(values(vec![(
                Dependency::key("x"),
                DependencyValue::Key(Some("<a & b>".into())),
            )]))
            .expect("render");
        match outcome {
            RenderOutcome::Ready { contents, .. } => assert_eq!(contents, "<a & b>"),
            other => panic!("expected Ready, got {other:?}"),
        }
    }
}
