//! Plan display

use colored::Colorize;
use declarative::{Action, ExecutionPlan, ResourceDiff, group_by_type};
use serde_json::Value;
use similar::{ChangeTag, TextDiff};

use crate::ui;

/// Print the change set of a plan, grouped by resource type
///
/// Unchanged resources are listed too when `show_unchanged` is set.
pub fn display_plan(plan: &ExecutionPlan, show_unchanged: bool) {
    let changes: Vec<ResourceDiff> = plan
        .diffs
        .iter()
        .filter(|d| show_unchanged || !d.is_noop())
        .cloned()
        .collect();
    if !plan.has_changes() && !show_unchanged {
        println!();
        println!("  {} No changes needed", "✓".green());
        return;
    }

    println!();
    println!("{}", ui::box_top(&format!("Plan for scope '{}'", plan.scope)));
    println!("│");

    for (resource_type, diffs) in group_by_type(&changes) {
        println!("│ {}", resource_type.bold());
        for diff in diffs {
            println!(
                "│   {} {:<30} {}",
                symbol(diff.action),
                diff.resource_id,
                describe(diff).dimmed()
            );
            if diff.is_modification() {
                for line in prop_diff(diff) {
                    println!("│       {line}");
                }
            }
        }
        println!("│");
    }

    let summary = plan.summary();
    println!("├─────────────────────────────────────────────────────┤");
    println!(
        "│ Summary: {} to create, {} to update, {} to remove, {} unchanged",
        summary.additions.to_string().green(),
        summary.modifications.to_string().yellow(),
        summary.removals.to_string().red(),
        summary.unchanged.to_string().dimmed()
    );
    println!("└─────────────────────────────────────────────────────┘");
}

fn symbol(action: Action) -> colored::ColoredString {
    match action {
        Action::Create => "+".green(),
        Action::Delete => "-".red(),
        Action::Update => "~".yellow(),
        Action::Noop => "○".dimmed(),
    }
}

/// Short trailing description for one diff
pub fn describe(diff: &ResourceDiff) -> String {
    let pending = if diff.pending_references {
        " (known after apply)"
    } else {
        ""
    };
    match diff.action {
        Action::Create => format!("(new){pending}"),
        Action::Delete => "(will remove)".to_string(),
        Action::Update => {
            let fields = diff.changed_fields();
            if fields.is_empty() {
                format!("(changes){pending}")
            } else {
                format!("({}){pending}", fields.join(", "))
            }
        }
        Action::Noop => String::new(),
    }
}

/// Line diff of the pretty-printed recorded and desired props
pub fn prop_diff(diff: &ResourceDiff) -> Vec<String> {
    let before = pretty(diff.current.as_ref());
    let after = pretty(diff.desired.as_ref());
    TextDiff::from_lines(&before, &after)
        .iter_all_changes()
        .filter_map(|change| {
            let line = change.value().trim_end();
            match change.tag() {
                ChangeTag::Delete => Some(format!("- {line}").red().to_string()),
                ChangeTag::Insert => Some(format!("+ {line}").green().to_string()),
                ChangeTag::Equal => None,
            }
        })
        .collect()
}

fn pretty(value: Option<&Value>) -> String {
    value
        .and_then(|v| serde_json::to_string_pretty(v).ok())
        .map(|s| s + "\n")
        .unwrap_or_default()
}
