//! Headless console front end standing in for the rendering layer.

pub mod chat_view;
pub mod main_window;
pub mod sidebar;
