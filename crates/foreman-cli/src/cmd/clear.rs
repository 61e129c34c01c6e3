use crate::cmd;
use std::io::Write;
use std::path::Path;

pub fn run(project: &Path, config_path: Option<&Path>, yes: bool) -> anyhow::Result<i32> {
    let config = cmd::load_config(project, config_path)?;
    let store = cmd::store_for(project, &config);
    let runs = store.list_runs()?;
    if runs.is_empty() {
        println!("nothing to clear");
        return Ok(0);
    }

    if !yes {
        print!(
            "delete {} run snapshot(s) under {}? backups are kept [y/N] ",
            runs.len(),
            store.dir().display()
        );
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("aborted");
            return Ok(0);
        }
    }

    store.clear()?;
    println!("cleared {} run snapshot(s)", runs.len());
    Ok(0)
}
