use thiserror::Error;

#[derive(Error, Debug)]
pub enum MangoError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Local store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Insufficient storage: {available_bytes} bytes available, {required_bytes} required")]
    InsufficientStorage {
        available_bytes: u64,
        required_bytes: u64,
    },

    #[error("Download already in progress: {0}")]
    AlreadyInProgress(String),

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("Remote rejected the request: {0}")]
    RemoteRejection(String),

    #[error("Chapter {chapter_id} incomplete: {missing} of {expected} pages failed")]
    PartialDownload {
        chapter_id: String,
        missing: usize,
        expected: usize,
    },

    #[error("Download cancelled: {0}")]
    Cancelled(String),

    #[error("Chapter not found: {0}")]
    ChapterNotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl MangoError {
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkFailure(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::RemoteRejection(msg.into())
    }

    pub fn chapter_not_found(chapter_id: impl Into<String>) -> Self {
        Self::ChapterNotFound(chapter_id.into())
    }

    pub fn invalid_data(msg: impl Into<String>) -> Self {
        Self::InvalidData(msg.into())
    }

    /// True when the failure happened on the transport, i.e. the remote never answered.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Http(_) | Self::NetworkFailure(_))
    }

    /// Failures after which the local state is kept and reconciled later.
    pub fn is_soft(&self) -> bool {
        self.is_network() || matches!(self, Self::StoreUnavailable(_) | Self::AlreadyInProgress(_))
    }

    /// Short localized message for the toast shown to the reader.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InsufficientStorage { .. } => {
                "Không đủ dung lượng. Vui lòng xóa một số chương đã tải."
            }
            Self::AlreadyInProgress(_) => "Chương này đang được tải xuống",
            Self::Http(_) | Self::NetworkFailure(_) => "Lỗi kết nối mạng, vui lòng thử lại",
            Self::RemoteRejection(_) => "Thao tác thất bại",
            Self::PartialDownload { .. } | Self::Cancelled(_) => {
                "Không thể tải xuống chương này"
            }
            Self::StoreUnavailable(_) | Self::Database(_) => {
                "Bộ nhớ ngoại tuyến không khả dụng"
            }
            Self::ChapterNotFound(_) => "Không tìm thấy chương",
            _ => "Đã xảy ra lỗi",
        }
    }
}

pub type Result<T> = std::result::Result<T, MangoError>;
