//! Template renderer based on MiniJinja

use minijinja::{Environment, Error, UndefinedBehavior, Value};
use serde_json::Value as JsonValue;
use stackfile_core::{Map, cast_keys_to_strings};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{EngineError, Result, TemplateError};
use crate::filters;
use crate::functions;
use crate::secrets::{Evaluator, contains_refs};

/// File extensions whose content is rendered before use
pub const TEMPLATE_EXTENSIONS: &[&str] = &[".gotmpl", ".j2"];

/// Injected file reader, so rendering can be tested without real I/O
pub type ReadFileFn = Arc<dyn Fn(&Path) -> std::io::Result<String> + Send + Sync>;

pub fn os_read_file() -> ReadFileFn {
    Arc::new(|path: &Path| std::fs::read_to_string(path))
}

pub fn is_template_file(path: &Path) -> bool {
    let name = path.to_string_lossy();
    TEMPLATE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Renderer builder
pub struct RendererBuilder {
    base_dir: PathBuf,
    read_file: ReadFileFn,
    pre_render: bool,
    evaluator: Option<Arc<dyn Evaluator>>,
}

impl RendererBuilder {
    /// Stub `read_file` and `exec`, and render missing keys as empty
    pub fn pre_render(mut self, pre_render: bool) -> Self {
        self.pre_render = pre_render;
        self
    }

    pub fn file_reader(mut self, read_file: ReadFileFn) -> Self {
        self.read_file = read_file;
        self
    }

    pub fn evaluator(mut self, evaluator: Option<Arc<dyn Evaluator>>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn build(self) -> Renderer {
        let env = create_environment(&self.base_dir, &self.read_file, self.pre_render);
        Renderer {
            env,
            base_dir: self.base_dir,
            read_file: self.read_file,
            pre_render: self.pre_render,
            evaluator: self.evaluator,
        }
    }
}

/// The template renderer
///
/// Owns a base directory for relative paths, the file reader collaborator,
/// the pre-render flag, and an optional secret evaluator.
pub struct Renderer {
    env: Environment<'static>,
    base_dir: PathBuf,
    read_file: ReadFileFn,
    pre_render: bool,
    evaluator: Option<Arc<dyn Evaluator>>,
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("base_dir", &self.base_dir)
            .field("pre_render", &self.pre_render)
            .finish()
    }
}

impl Renderer {
    pub fn builder(base_dir: impl Into<PathBuf>) -> RendererBuilder {
        RendererBuilder {
            base_dir: base_dir.into(),
            read_file: os_read_file(),
            pre_render: false,
            evaluator: None,
        }
    }

    /// Full-mode renderer reading from the OS file system
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::builder(base_dir).build()
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn is_pre_render(&self) -> bool {
        self.pre_render
    }

    /// Render a template string against `data`
    pub fn render_string(&self, name: &str, source: &str, data: &JsonValue) -> Result<String> {
        self.env
            .render_named_str(name, source, Value::from_serialize(data))
            .map_err(|e| EngineError::Template(TemplateError::from_minijinja(e, name, source)))
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Read a file, rendering it first when it carries a template extension
    pub fn render_file(&self, path: &Path, data: &JsonValue) -> Result<String> {
        let full = self.resolve(path);
        let content = (self.read_file)(&full).map_err(|source| EngineError::Read {
            path: full.display().to_string(),
            source,
        })?;

        if is_template_file(&full) {
            tracing::debug!(path = %full.display(), "rendering template file");
            self.render_string(&full.display().to_string(), &content, data)
        } else {
            Ok(content)
        }
    }

    pub fn render_to_bytes(&self, path: &Path, data: &JsonValue) -> Result<Vec<u8>> {
        self.render_file(path, data).map(String::into_bytes)
    }

    /// Load a values file: render if templated, parse YAML, normalise keys,
    /// then resolve secret references.
    pub fn render_values_file(&self, path: &Path, data: &JsonValue) -> Result<Map> {
        let text = self.render_file(path, data)?;
        let label = self.resolve(path).display().to_string();
        self.parse_values(&label, &text)
    }

    pub fn parse_values(&self, label: &str, text: &str) -> Result<Map> {
        let yaml: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|source| EngineError::Yaml {
                path: label.to_string(),
                source,
            })?;
        let map = match cast_keys_to_strings(yaml)? {
            JsonValue::Object(map) => map,
            JsonValue::Null => Map::new(),
            other => {
                return Err(EngineError::NotAMap {
                    path: label.to_string(),
                    found: stackfile_core::values::type_name(&other),
                });
            }
        };
        self.expand_refs(map)
    }

    /// Route a structure through the evaluator when it holds references
    pub fn expand_refs(&self, map: Map) -> Result<Map> {
        match &self.evaluator {
            Some(evaluator) if contains_refs(&JsonValue::Object(map.clone())) => {
                evaluator.eval(&map)
            }
            _ => Ok(map),
        }
    }
}

fn create_environment(base_dir: &Path, read_file: &ReadFileFn, pre_render: bool) -> Environment<'static> {
    let mut env = Environment::new();

    if pre_render {
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
    } else {
        env.set_undefined_behavior(UndefinedBehavior::Strict);
    }
    env.set_keep_trailing_newline(true);

    env.add_filter("toyaml", filters::toyaml);
    env.add_filter("fromyaml", filters::fromyaml);
    env.add_filter("b64encode", filters::b64encode);
    env.add_filter("b64decode", filters::b64decode);
    env.add_filter("quote", filters::quote);
    env.add_filter("squote", filters::squote);
    env.add_filter("nindent", filters::nindent);
    env.add_filter("indent", filters::indent);
    env.add_filter("required", filters::required);
    env.add_filter("sha256", filters::sha256sum);
    env.add_filter("trimprefix", filters::trimprefix);
    env.add_filter("trimsuffix", filters::trimsuffix);

    env.add_function("to_yaml", filters::toyaml);
    env.add_function("from_yaml", filters::fromyaml);
    env.add_function("set_value_at_path", functions::set_value_at_path);
    env.add_function("required_env", functions::required_env);
    env.add_function("get", functions::get);
    env.add_function("get_or_nil", functions::get_or_nil);
    env.add_function("tpl", functions::tpl);

    let reader = Arc::clone(read_file);
    let dir = base_dir.to_path_buf();
    env.add_function("read_file", move |path: String| -> std::result::Result<String, Error> {
        if pre_render {
            return Ok(String::new());
        }
        functions::read_file(&reader, &dir, &path)
    });

    let dir = base_dir.to_path_buf();
    env.add_function(
        "exec",
        move |command: String, args: Vec<Value>, stdin: Option<String>| -> std::result::Result<String, Error> {
            if pre_render {
                return Ok(String::new());
            }
            functions::exec(&dir, &command, &args, stdin.as_deref())
        },
    );

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::CachingEvaluator;
    use serde_json::json;
    use std::collections::HashMap;

    fn memory_reader(files: &[(&str, &str)]) -> ReadFileFn {
        let files: HashMap<PathBuf, String> = files
            .iter()
            .map(|(p, c)| (PathBuf::from(p), c.to_string()))
            .collect();
        Arc::new(move |path: &Path| {
            files.get(path).cloned().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, path.display().to_string())
            })
        })
    }

    #[test]
    fn test_render_string() {
        let renderer = Renderer::new("/work");
        let out = renderer
            .render_string("t", "{{ environment.name }}-{{ values.x }}", &json!({"environment": {"name": "prod"}, "values": {"x": 1}}))
            .unwrap();
        assert_eq!(out, "prod-1");
    }

    #[test]
    fn test_strict_mode_fails_on_missing_key() {
        let renderer = Renderer::new("/work");
        let err = renderer
            .render_string("t", "{{ values.missing.key }}", &json!({"values": {}}))
            .unwrap_err();
        assert!(matches!(err, EngineError::Template(_)));
    }

    #[test]
    fn test_pre_render_tolerates_missing_keys_and_stubs_side_effects() {
        let renderer = Renderer::builder("/work")
            .pre_render(true)
            .file_reader(memory_reader(&[("/work/a.txt", "content")]))
            .build();
        let out = renderer
            .render_string(
                "t",
                "[{{ values.missing.key }}][{{ read_file('a.txt') }}][{{ exec('false', []) }}]",
                &json!({"values": {}}),
            )
            .unwrap();
        assert_eq!(out, "[][][]");
    }

    #[test]
    fn test_read_file_relative_to_base_dir() {
        let renderer = Renderer::builder("/work")
            .file_reader(memory_reader(&[("/work/a.txt", "content"), ("/abs/b.txt", "abs")]))
            .build();
        let out = renderer
            .render_string("t", "{{ read_file('a.txt') }}/{{ read_file('/abs/b.txt') }}", &json!({}))
            .unwrap();
        assert_eq!(out, "content/abs");
    }

    #[test]
    fn test_render_file_only_renders_template_extensions() {
        let renderer = Renderer::builder("/work")
            .file_reader(memory_reader(&[
                ("/work/plain.yaml", "name: '{{ environment.name }}'\n"),
                ("/work/tmpl.yaml.gotmpl", "name: '{{ environment.name }}'\n"),
            ]))
            .build();
        let data = json!({"environment": {"name": "production"}});

        let plain = renderer.render_values_file(Path::new("plain.yaml"), &data).unwrap();
        let tmpl = renderer.render_values_file(Path::new("tmpl.yaml.gotmpl"), &data).unwrap();

        assert_eq!(plain["name"], "{{ environment.name }}");
        assert_eq!(tmpl["name"], "production");
    }

    #[test]
    fn test_get_and_tpl_in_templates() {
        let renderer = Renderer::new("/work");
        let data = json!({"values": {"db": {"port": 5432}}, "release": {"name": "api"}});
        let out = renderer
            .render_string(
                "t",
                "{{ get('db.port', values) }} {{ get('db.host', 'localhost', values) }} {{ get_or_nil('db.user', values) is none }} {{ tpl('{{ name }}!', {'name': release.name}) }}",
                &data,
            )
            .unwrap();
        assert_eq!(out, "5432 localhost true api!");
    }

    #[test]
    fn test_values_file_refs_go_through_evaluator() {
        struct Upper;
        impl Evaluator for Upper {
            fn eval(&self, input: &Map) -> Result<Map> {
                Ok(input
                    .iter()
                    .map(|(k, _)| (k.clone(), JsonValue::String(k.to_uppercase())))
                    .collect())
            }
        }

        let renderer = Renderer::builder("/work")
            .file_reader(memory_reader(&[("/work/s.yaml", "pw: ref+echo://secret\n")]))
            .evaluator(Some(Arc::new(CachingEvaluator::new(Arc::new(Upper)))))
            .build();
        let map = renderer.render_values_file(Path::new("s.yaml"), &json!({})).unwrap();
        assert_eq!(map["pw"], "REF+ECHO://SECRET");
    }

    #[test]
    fn test_is_template_file() {
        assert!(is_template_file(Path::new("values.yaml.gotmpl")));
        assert!(is_template_file(Path::new("values.yaml.j2")));
        assert!(!is_template_file(Path::new("values.yaml")));
    }
}
