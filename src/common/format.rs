//! 展示用格式化与文件类型推断

/// 格式化字节大小
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// 格式化剩余时间
///
/// 未知时返回 "Calculating..."，不显示为 0
pub fn format_eta(seconds: Option<u64>) -> String {
    let Some(secs) = seconds else {
        return "Calculating...".to_string();
    };

    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let rest = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, rest)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, rest)
    } else {
        format!("{}s", rest)
    }
}

/// 根据扩展名推断 MIME 类型
pub fn infer_mime_type(file_name: &str) -> &'static str {
    let ext = match file_name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return "application/octet-stream",
    };

    match ext.as_str() {
        "pdf" => "application/pdf",
        "iso" => "application/x-iso9660-image",
        "zip" => "application/zip",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "txt" => "text/plain",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => "application/octet-stream",
    }
}
