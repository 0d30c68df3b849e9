/// Runs `mode` and cancels it once `budget` has elapsed.
async fn run_budgeted(
    engine: &SyncEngine,
    mode: RunMode,
    budget: Duration,
) -> anyhow::Result<RunOutcome> {
    let expiration = CancellationToken::new();
    let timer = {
        let expiration = expiration.clone();
        tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            expiration.cancel();
        })
    };
    let outcome = engine.run_sync(mode, &expiration).await;
    timer.abort();
    Ok(outcome?)
}

async fn persist_last_completed(engine: &SyncEngine, config: &DaemonConfig) -> anyhow::Result<()> {
    let state = RunState {
        last_completed: engine.last_completed(),
    };
    save_run_state(&config.run_state_path(), &state).await
}

async fn load_run_state(path: &Path) -> anyhow::Result<RunState> {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(state) => Ok(state),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring unreadable run state");
                Ok(RunState::default())
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(RunState::default()),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

async fn save_run_state(path: &Path, state: &RunState) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(state)?;
    let partial = path.with_extension("json.partial");
    tokio::fs::write(&partial, &bytes)
        .await
        .with_context(|| format!("failed to write {}", partial.display()))?;
    tokio::fs::rename(&partial, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

pub fn format_error_log(entries: &[ErrorLogEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&format!("{} [{}]\n", entry.file, entry.state));
        for error in &entry.errors {
            out.push_str(&format!("  - {error}\n"));
        }
        if entry.can_ignore_missing {
            out.push_str("  (can be retried ignoring missing dependents)\n");
        }
    }
    out
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("locosync")
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
