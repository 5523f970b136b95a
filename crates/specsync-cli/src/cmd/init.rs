use anyhow::Context;
use specsync_core::canon::CanonRule;
use specsync_core::io::{ensure_dir, write_if_missing};
use specsync_core::manifest::{
    manifest_path, Manifest, ProvenanceStyle, TransformSpec,
};
use std::path::{Path, PathBuf};

const EXAMPLE_SPEC: &str = r#"@prefix ex: <http://example.org/spec#> .

ex:hello a ex:Command ;
    ex:label "hello" ;
    ex:doc "Print a friendly greeting" .

ex:version a ex:Command ;
    ex:label "version" .
"#;

const EXAMPLE_SHAPES: &str = r#"shapes:
  - target_class: "http://example.org/spec#Command"
    properties:
      - path: "http://example.org/spec#label"
        min_count: 1
        max_count: 1
        datatype: string
        pattern: "[a-z][a-z0-9-]*"
      - path: "http://example.org/spec#doc"
        max_count: 1
        datatype: string
"#;

const EXAMPLE_QUERY: &str = r#"PREFIX ex: <http://example.org/spec#>
SELECT ?label ?doc WHERE {
  ?cmd a ex:Command .
  ?cmd ex:label ?label .
  OPTIONAL { ?cmd ex:doc ?doc }
} ORDER BY ?label
"#;

const EXAMPLE_TEMPLATE: &str = r#"# {{ project }} commands ({{ rows | length }})

{% for cmd in rows %}## {{ cmd.label }}

{% if cmd.doc %}{{ cmd.doc }}{% else %}Undocumented.{% endif %}

{% endfor %}"#;

pub fn run(root: &Path) -> anyhow::Result<()> {
    let project_name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());

    for dir in ["specs", "shapes", "queries", "templates", "docs"] {
        ensure_dir(&root.join(dir)).with_context(|| format!("failed to create {dir}/"))?;
    }

    let mut created = Vec::new();
    let scaffold: &[(&str, &str)] = &[
        ("specs/commands.ttl", EXAMPLE_SPEC),
        ("shapes/commands.yaml", EXAMPLE_SHAPES),
        ("queries/commands.rq", EXAMPLE_QUERY),
        ("templates/commands.md.tera", EXAMPLE_TEMPLATE),
    ];
    for (path, content) in scaffold {
        if write_if_missing(&root.join(path), content.as_bytes())? {
            created.push(path.to_string());
        }
    }

    if !manifest_path(root).exists() {
        let mut manifest = Manifest::new(project_name.clone());
        manifest
            .context
            .insert("project".to_string(), project_name);
        manifest.transforms.insert(
            "commands".to_string(),
            TransformSpec {
                description: Some("Command reference generated from the command graph".into()),
                inputs: vec![PathBuf::from("specs/commands.ttl")],
                shapes: vec![PathBuf::from("shapes/commands.yaml")],
                query: PathBuf::from("queries/commands.rq"),
                template: PathBuf::from("templates/commands.md.tera"),
                output: PathBuf::from("docs/commands.md"),
                canonicalize: CanonRule::all_text_rules(),
                formatter: None,
                provenance: Some(ProvenanceStyle {
                    prefix: "<!--".into(),
                    suffix: Some(" -->".into()),
                }),
                lock_timeout_seconds: 30,
            },
        );
        manifest.save(root).context("failed to write manifest")?;
        created.push(specsync_core::manifest::MANIFEST_FILE.to_string());
    }

    if created.is_empty() {
        println!("Already initialized. Nothing to do.");
    } else {
        println!("Initialized specsync project:");
        for path in created {
            println!("  created {path}");
        }
        println!("\nNext: run 'specsync sync' to generate docs/commands.md");
    }
    Ok(())
}
