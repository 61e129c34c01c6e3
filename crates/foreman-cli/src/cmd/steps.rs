use crate::cmd;
use std::path::Path;

pub fn run(project: &Path, config_path: Option<&Path>) -> anyhow::Result<i32> {
    let config = cmd::load_config(project, config_path)?;
    let catalog = cmd::load_catalog(project, &config)?;

    println!("{} steps in {}", catalog.len(), config.steps_file);
    for step in &catalog.steps {
        println!("{:>3}. {}", step.id, step.name);
        for criterion in &step.completion_criteria {
            println!("       - {criterion}");
        }
    }
    let placeholders = catalog.placeholders();
    if !placeholders.is_empty() {
        println!(
            "placeholders: {}",
            placeholders.into_iter().collect::<Vec<_>>().join(", ")
        );
    }
    Ok(0)
}
