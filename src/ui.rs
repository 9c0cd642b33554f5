use colored::Colorize;

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Box header line, padded to a fixed width
pub fn box_top(title: &str) -> String {
    let fill = 50usize.saturating_sub(title.chars().count());
    format!("┌─ {} {}┐", title.bold(), "─".repeat(fill))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_top_width() {
        colored::control::set_override(false);
        let line = box_top("Plan");
        assert!(line.starts_with("┌─ Plan ─"));
        assert_eq!(line.chars().count(), 55);
        assert_eq!(box_top(&"x".repeat(60)).chars().count(), 65);
    }
}
