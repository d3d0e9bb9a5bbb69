pub mod cubepilot;
