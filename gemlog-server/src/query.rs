use gemlog_api::{Listing, Sort, SortKey};

pub enum Bind {
    String(String),
}

#[derive(Default)]
pub struct Sql {
    pub where_clause: String,
    pub order_clause: String,
    pub binds: Vec<Bind>,
}

impl Sql {
    /// Adds a Bind, returning the index that should be used to refer to it assuming the first bind is at index first_bind_idx
    fn add_bind(&mut self, first_bind_idx: usize, b: Bind) -> usize {
        let res = first_bind_idx + self.binds.len();
        self.binds.push(b);
        res
    }
}

/// Assumes table p (posts) is available
pub fn to_postgres(l: &Listing, first_bind_idx: usize) -> Sql {
    let mut res = Sql::default();
    match &l.search {
        None => res.where_clause.push_str("true"),
        Some(search) => {
            let idx = res.add_bind(first_bind_idx, Bind::String(like_pattern(search)));
            res.where_clause.push_str(&format!(
                "(p.title ILIKE ${idx} ESCAPE '\\' OR p.content ILIKE ${idx} ESCAPE '\\')"
            ));
        }
    }
    res.order_clause = order_by(l.sort);
    res
}

fn order_by(sort: Sort) -> String {
    let column = match sort.key {
        SortKey::CreatedAt => "p.created_at",
        SortKey::UpdatedAt => "p.updated_at",
        // byte order, matching what clients get when sorting strings themselves
        SortKey::Title => "p.title COLLATE \"C\"",
    };
    let dir = match sort.descending {
        true => "DESC",
        false => "ASC",
    };
    format!("{column} {dir}, p.seq {dir}")
}

/// Pattern matching any string that contains `needle`
pub fn like_pattern(needle: &str) -> String {
    let mut res = String::with_capacity(needle.len() + 2);
    res.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            res.push('\\');
        }
        res.push(c);
    }
    res.push('%');
    res
}
