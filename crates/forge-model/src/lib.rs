// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod client;
mod cost;
mod request_log;
mod types;

pub use client::{BlockingLlmClient, LlmClient, LlmError};
pub use cost::{CostSnapshot, CostTracker};
pub use request_log::{RequestLog, RequestLogEntry};
pub use types::{
    ApiMessage, CacheControl, ContentPart, MessageBody, ResponseEvent, Role, StreamAccumulator,
    ToolCallSpec, WireFunction, WireToolCall,
};
