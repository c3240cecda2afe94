use decoder_lm::CausalMask;

#[test]
fn test_allowed_iff_not_future() {
    for n in 0..8 {
        let mask = CausalMask::new(n);
        assert_eq!(mask.size(), n);
        for i in 0..n {
            for j in 0..n {
                assert_eq!(mask.is_allowed(i, j), j <= i, "n={} ({}, {})", n, i, j);
            }
        }
    }
}

#[test]
fn test_allowed_count_is_triangular() {
    for n in [0usize, 1, 2, 5, 17, 64] {
        let mask = CausalMask::new(n);
        assert_eq!(mask.allowed_count(), n * (n + 1) / 2);
    }
}

#[test]
fn test_mask_is_lower_triangular_array() {
    let mask = CausalMask::new(3);
    let array = mask.as_array();
    assert_eq!(array.dim(), (3, 3));
    assert!(array[[2, 0]] && array[[1, 1]]);
    assert!(!array[[0, 2]]);
    assert_eq!(mask, CausalMask::new(3));
}
