//! Styles for the interactive session.

use ratatui::style::{Color, Modifier, Style};

/// Built once at startup and only ever read by the renderer.
#[derive(Debug, Clone)]
pub(crate) struct StyleRegistry {
    pub(crate) title: Style,
    pub(crate) label: Style,
    pub(crate) help: Style,
    pub(crate) input: Style,
    pub(crate) success: Style,
    pub(crate) error: Style,
    pub(crate) border: Style,
    pub(crate) text: Style,
}

impl StyleRegistry {
    pub(crate) fn new() -> Self {
        Self {
            title: Style::default()
                .fg(Color::Indexed(63))
                .add_modifier(Modifier::BOLD),
            label: Style::default().fg(Color::Indexed(39)),
            help: Style::default().fg(Color::Indexed(240)),
            input: Style::default().fg(Color::Indexed(255)),
            success: Style::default()
                .fg(Color::Indexed(42))
                .add_modifier(Modifier::BOLD),
            error: Style::default()
                .fg(Color::Indexed(196))
                .add_modifier(Modifier::BOLD),
            border: Style::default().fg(Color::Indexed(240)),
            text: Style::default(),
        }
    }
}

impl Default for StyleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
