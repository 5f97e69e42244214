// UUID утилиты

/// Новый id беседы
pub fn generate_v4() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_generated_ids_are_valid_and_unique() {
        let a = generate_v4();
        let b = generate_v4();
        assert_eq!(Uuid::parse_str(&a).unwrap().get_version_num(), 4);
        assert_ne!(a, b);
    }
}
