use stratum_db::{Direction, MigrationState, MigrationStatus, RunReport};

/// Status rows as an aligned table.
pub fn status_table(rows: &[MigrationStatus]) -> String {
    if rows.is_empty() {
        return "no migrations found\n".to_string();
    }

    let name_w = rows
        .iter()
        .map(|r| r.name.len())
        .max()
        .unwrap_or(0)
        .max("NAME".len());
    let version_w = rows
        .iter()
        .map(|r| r.version.to_string().len())
        .max()
        .unwrap_or(0)
        .max("VERSION".len());

    let mut out = format!(
        "{:<version_w$}  {:<name_w$}  {:<8} APPLIED AT\n",
        "VERSION", "NAME", "STATE"
    );
    for row in rows {
        let state = match row.state {
            MigrationState::Applied => "applied",
            MigrationState::Pending => "pending",
        };
        let applied_at = row
            .applied_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<version_w$}  {:<name_w$}  {:<8} {applied_at}\n",
            row.version.to_string(),
            row.name,
            state
        ));
    }

    let pending = rows
        .iter()
        .filter(|r| r.state == MigrationState::Pending)
        .count();
    out.push_str(&format!("\n{} applied, {pending} pending\n", rows.len() - pending));
    out
}

/// One-paragraph summary of a run for stdout.
pub fn report_summary(report: &RunReport, dry_run: bool) -> String {
    let verb = match report.direction {
        Direction::Up => "applied",
        Direction::Down => "reverted",
    };
    let prefix = if dry_run { "[dry run] " } else { "" };

    let mut out = String::new();
    for warning in &report.warnings {
        out.push_str(&format!("{prefix}warning: {warning}\n"));
    }
    if report.applied.is_empty() {
        out.push_str(&format!("{prefix}nothing {verb}\n"));
    } else {
        for version in &report.applied {
            out.push_str(&format!("{prefix}{verb} {version}\n"));
        }
        out.push_str(&format!(
            "{prefix}{} migration{} {verb}\n",
            report.applied.len(),
            if report.applied.len() == 1 { "" } else { "s" }
        ));
    }
    if report.cancelled {
        out.push_str(&format!("{prefix}cancelled; remaining migrations were not run\n"));
    }
    out
}
