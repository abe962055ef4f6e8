pub const PRIVATE_PREFIX: &str = "private-";

pub fn main_channel(prefix: &str, class_id: &str) -> String {
    format!("{}{}", prefix, class_id)
}

/// Pair channel for a teacher/student private chat. Both sides call this with
/// the same argument order so they land on the same channel.
pub fn private_channel(teacher_id: &str, student_id: &str) -> String {
    format!("{}{}_{}", PRIVATE_PREFIX, teacher_id, student_id)
}

/// Per-student channel on which private chat requests arrive
pub fn inbox_channel(student_id: &str) -> String {
    format!("{}{}", PRIVATE_PREFIX, student_id)
}
