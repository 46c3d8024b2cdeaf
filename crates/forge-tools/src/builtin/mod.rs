// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod commit;
pub mod compact;
pub mod delete_file;
pub mod done;
pub mod edit;
pub mod grep_open;
pub mod rename_file;
pub mod scout;
pub mod think;
pub mod update_context;
pub mod write_file;

use std::sync::Arc;

use crate::tool::Tool;

pub use commit::CommitTool;
pub use compact::CompactTool;
pub use delete_file::DeleteFileTool;
pub use done::DoneTool;
pub use edit::EditTool;
pub use grep_open::GrepOpenTool;
pub use rename_file::RenameFileTool;
pub use run_tests::RunTestsTool;
pub use scout::ScoutTool;
pub use think::ThinkTool;
pub use update_context::UpdateContextTool;
pub use write_file::WriteFileTool;

/// The standard built-in tool set, always approved.
pub fn all() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(WriteFileTool),
        Arc::new(DeleteFileTool),
        Arc::new(RenameFileTool),
        Arc::new(EditTool),
        Arc::new(UpdateContextTool),
        Arc::new(GrepOpenTool),
        Arc::new(ThinkTool),
        Arc::new(CompactTool),
        Arc::new(CommitTool),
        Arc::new(RunTestsTool),
        Arc::new(ScoutTool),
        Arc::new(DoneTool),
    ]
}
