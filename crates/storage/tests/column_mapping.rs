use std::collections::HashSet;

use stakeidx_storage::Column;

#[test]
fn column_indexes_are_dense_and_unique() {
    for (idx, column) in Column::ALL.iter().copied().enumerate() {
        assert_eq!(column.index(), idx, "{column:?}");
    }
    let names: HashSet<&str> = Column::ALL.iter().map(|column| column.as_str()).collect();
    assert_eq!(names.len(), Column::ALL.len());
}
