pub mod client;

pub use client::{JiraClient, JiraCredentials, JiraError, JiraField, JiraFieldSchema, JiraUser};
