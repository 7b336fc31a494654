use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");
pub static PENCIL: Emoji<'_, '_> = Emoji("📝 ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_step(step: &str) {
    println!("{} {}", SPARKLE, style(step).bold());
}

/// A titled block of `command  description` rows for the help screen.
pub struct GuideSection {
    title: String,
    rows: Vec<(String, String)>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.rows.push((name.to_string(), description.to_string()));
        self
    }

    fn width(&self) -> usize {
        self.rows.iter().map(|(name, _)| name.len()).max().unwrap_or(0)
    }

    pub fn print(&self) {
        println!("\n {}", style(&self.title).bold().underlined());
        let width = self.width();
        for (name, description) in &self.rows {
            println!(
                "   {}  {}",
                style(format!("{:<width$}", name, width = width)).green(),
                style(description).dim()
            );
        }
    }
}

pub fn print_banner() {
    let lines: &[&str] = &[
        " _       _          _ _                   ",
        "| | __ _| |__   ___| | | ___   ___  _ __  ",
        "| |/ _` | '_ \\ / _ \\ | |/ _ \\ / _ \\| '_ \\ ",
        "| | (_| | |_) |  __/ | | (_) | (_) | |_) |",
        "|_|\\__,_|_.__/ \\___|_|_|\\___/ \\___/| .__/ ",
        "                                   |_|    ",
    ];

    // Gradient: #34d399 -> #22d3ee -> #818cf8 (diagonal top-left -> bottom-right)
    let stops: [(u8, u8, u8); 3] = [(52, 211, 153), (34, 211, 238), (129, 140, 248)];
    let max_w = 42u32;
    let max_d = max_w + 5 * 10;

    println!();
    for (y, line) in lines.iter().enumerate() {
        for (x, ch) in line.chars().enumerate() {
            if ch == ' ' {
                print!(" ");
                continue;
            }
            let d = ((x as u32 + y as u32 * 10) * 1000 / max_d).min(1000);
            let (r, g, b) = if d <= 500 {
                lerp_color(stops[0], stops[1], d * 2)
            } else {
                lerp_color(stops[1], stops[2], (d - 500) * 2)
            };
            print!("\x1b[38;2;{};{};{}m{}", r, g, b, ch);
        }
        println!();
    }
    print!("\x1b[0m");

    println!("\x1b[38;2;34;211;238mThe model proposes, you decide.\x1b[0m\n");
}

fn lerp_color(a: (u8, u8, u8), b: (u8, u8, u8), t: u32) -> (u8, u8, u8) {
    let r = (a.0 as u32 * (1000 - t) + b.0 as u32 * t) / 1000;
    let g = (a.1 as u32 * (1000 - t) + b.1 as u32 * t) / 1000;
    let b_val = (a.2 as u32 * (1000 - t) + b.2 as u32 * t) / 1000;
    (r as u8, g as u8, b_val as u8)
}
