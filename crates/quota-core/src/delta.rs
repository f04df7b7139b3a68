/// Signed usage delta for a state transition `old -> new`, parametric in
/// the state type and the predicate that decides whether a given state
/// consumes the resource. Has no knowledge of which family it serves.
///
/// `+amount` if the entity started not consuming and now does; `-amount`
/// if it started consuming and now doesn't; `0` otherwise (including the
/// `old == new` case, by construction).
pub fn calculate_delta<T, F>(amount: i64, old: &T, new: &T, consumes: F) -> i64
where
    F: Fn(&T) -> bool,
{
    let was = consumes(old);
    let is = consumes(new);
    match (was, is) {
        (false, true) => amount,
        (true, false) => -amount,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_state_is_neutral() {
        for s in [false, true] {
            assert_eq!(calculate_delta(7, &s, &s, |b: &bool| *b), 0);
        }
    }

    #[test]
    fn entering_consume_set_is_positive() {
        assert_eq!(calculate_delta(4, &false, &true, |b: &bool| *b), 4);
    }

    #[test]
    fn leaving_consume_set_is_negative() {
        assert_eq!(calculate_delta(4, &true, &false, |b: &bool| *b), -4);
    }

    #[test]
    fn neither_consuming_is_neutral() {
        assert_eq!(calculate_delta(4, &false, &false, |b: &bool| *b), 0);
    }
}
