use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseKind {
    #[default]
    Normal,
    Upload,
}

/// Extra fields of a file upload
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FileMetadata {
    pub file_type: String,
    pub file_name: String,
    pub title: String,
    pub comment: Option<String>,
}

/// An outgoing message. For uploads, `text` is the file content.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Response {
    pub text: String,
    pub channel_id: String,
    pub kind: ResponseKind,
    pub attachments: Option<Value>,
    pub file: Option<FileMetadata>,
}

impl Response {
    pub fn text(channel_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            channel_id: channel_id.into(),
            ..Self::default()
        }
    }

    pub fn upload(
        channel_id: impl Into<String>,
        content: impl Into<String>,
        file: FileMetadata,
    ) -> Self {
        Self {
            text: content.into(),
            channel_id: channel_id.into(),
            kind: ResponseKind::Upload,
            attachments: None,
            file: Some(file),
        }
    }

    pub fn with_attachments(mut self, attachments: Value) -> Self {
        self.attachments = Some(attachments);
        self
    }

    /// Check the fields required by the response kind.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.channel_id.is_empty() {
            anyhow::bail!("response has no channel");
        }
        if self.text.is_empty() {
            anyhow::bail!("response has no text");
        }
        if self.kind == ResponseKind::Upload {
            let Some(file) = &self.file else {
                anyhow::bail!("upload has no file metadata");
            };
            if file.file_name.is_empty() {
                anyhow::bail!("upload has no file name");
            }
            if file.title.is_empty() {
                anyhow::bail!("upload has no title");
            }
        }
        Ok(())
    }
}

/// What a module answers to a message
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Send(Response),
    /// Handled; nothing to say
    Silent,
}
