use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};

use serde::Serialize;

use crate::decode::{ChildRecord, NestedEntity, Staged, StagingParent};

pub const DB_SCHEMA_VERSION: &str = "1.0.0";

/// Source column names that feed the same target field across the dataset
/// family.
pub mod columns {
    pub const MOVIE_ID: &[&str] = &["id", "movie_id", "movieId"];
    pub const LINK_MOVIE_ID: &[&str] = &["movieId", "movie_id", "id"];
    pub const RATING_MOVIE_ID: &[&str] = &["movieId", "movie_id"];
    pub const USER_ID: &[&str] = &["userId", "user_id"];
    pub const RATING_VALUE: &[&str] = &["rating", "rating_value"];
    pub const RATED_AT: &[&str] = &["timestamp", "rated_at"];
    pub const IMDB_ID: &[&str] = &["imdbId", "imdb_id"];
    pub const TMDB_ID: &[&str] = &["tmdbId", "tmdb_id"];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Date,
    Boolean,
    Json,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Integer | Self::Boolean => "INTEGER",
            Self::Real => "REAL",
            Self::Text | Self::Date | Self::Json => "TEXT",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ForeignKey {
    pub column: &'static str,
    pub references: Relation,
    pub references_column: &'static str,
}

#[derive(Debug)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: &'static [ColumnDef],
    pub primary_key: &'static [&'static str],
    pub foreign_keys: &'static [ForeignKey],
    pub checks: &'static [&'static str],
}

impl TableDef {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }
}

const fn col(name: &'static str, ty: ColumnType, nullable: bool) -> ColumnDef {
    ColumnDef { name, ty, nullable }
}

const MOVIE_FK: &[ForeignKey] = &[ForeignKey {
    column: "movie_id",
    references: Relation::Movies,
    references_column: "id",
}];

static MOVIES: TableDef = TableDef {
    name: "movies",
    columns: &[
        col("id", ColumnType::Integer, false),
        col("title", ColumnType::Text, true),
        col("original_title", ColumnType::Text, true),
        col("original_language", ColumnType::Text, true),
        col("overview", ColumnType::Text, true),
        col("tagline", ColumnType::Text, true),
        col("status", ColumnType::Text, true),
        col("homepage", ColumnType::Text, true),
        col("imdb_id", ColumnType::Text, true),
        col("poster_path", ColumnType::Text, true),
        col("adult", ColumnType::Boolean, false),
        col("video", ColumnType::Boolean, false),
        col("budget", ColumnType::Integer, true),
        col("revenue", ColumnType::Integer, true),
        col("runtime", ColumnType::Real, true),
        col("popularity", ColumnType::Real, true),
        col("vote_average", ColumnType::Real, true),
        col("vote_count", ColumnType::Integer, true),
        col("release_date", ColumnType::Date, true),
        col("production_countries", ColumnType::Json, true),
        col("spoken_languages", ColumnType::Json, true),
    ],
    primary_key: &["id"],
    foreign_keys: &[],
    checks: &[],
};

static MOVIE_GENRES: TableDef = TableDef {
    name: "movie_genres",
    columns: &[
        col("movie_id", ColumnType::Integer, false),
        col("genre_id", ColumnType::Integer, false),
        col("name", ColumnType::Text, false),
    ],
    primary_key: &["movie_id", "genre_id"],
    foreign_keys: MOVIE_FK,
    checks: &[],
};

static MOVIE_PRODUCTION_COMPANIES: TableDef = TableDef {
    name: "movie_production_companies",
    columns: &[
        col("movie_id", ColumnType::Integer, false),
        col("company_id", ColumnType::Integer, false),
        col("name", ColumnType::Text, false),
    ],
    primary_key: &["movie_id", "company_id"],
    foreign_keys: MOVIE_FK,
    checks: &[],
};

static MOVIE_COLLECTIONS: TableDef = TableDef {
    name: "movie_collections",
    columns: &[
        col("movie_id", ColumnType::Integer, false),
        col("collection_id", ColumnType::Integer, false),
        col("name", ColumnType::Text, false),
    ],
    primary_key: &["movie_id"],
    foreign_keys: MOVIE_FK,
    checks: &[],
};

static CREDITS: TableDef = TableDef {
    name: "credits",
    columns: &[
        col("movie_id", ColumnType::Integer, false),
        col("role", ColumnType::Text, false),
        col("ordinal", ColumnType::Integer, false),
        col("person_id", ColumnType::Integer, false),
        col("name", ColumnType::Text, false),
        col("character", ColumnType::Text, true),
        col("department", ColumnType::Text, true),
        col("job", ColumnType::Text, true),
        col("credit_order", ColumnType::Integer, true),
        col("credit_id", ColumnType::Text, true),
    ],
    primary_key: &["movie_id", "role", "ordinal"],
    foreign_keys: MOVIE_FK,
    checks: &["role IN ('cast', 'crew')"],
};

static KEYWORDS: TableDef = TableDef {
    name: "keywords",
    columns: &[
        col("movie_id", ColumnType::Integer, false),
        col("keyword_id", ColumnType::Integer, false),
        col("name", ColumnType::Text, false),
    ],
    primary_key: &["movie_id", "keyword_id"],
    foreign_keys: MOVIE_FK,
    checks: &[],
};

static RATINGS: TableDef = TableDef {
    name: "ratings",
    columns: &[
        col("user_id", ColumnType::Integer, false),
        col("movie_id", ColumnType::Integer, false),
        col("rating", ColumnType::Real, false),
        col("rated_at", ColumnType::Integer, false),
    ],
    primary_key: &["user_id", "movie_id"],
    foreign_keys: MOVIE_FK,
    checks: &["rating >= 0.5 AND rating <= 5.0"],
};

static LINKS: TableDef = TableDef {
    name: "links",
    columns: &[
        col("movie_id", ColumnType::Integer, false),
        col("imdb_id", ColumnType::Text, true),
        col("tmdb_id", ColumnType::Integer, true),
    ],
    primary_key: &["movie_id"],
    foreign_keys: MOVIE_FK,
    checks: &[],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Movies,
    MovieGenres,
    MovieProductionCompanies,
    MovieCollections,
    Credits,
    Keywords,
    Ratings,
    Links,
}

impl Relation {
    /// Parents before children, so creating in this order and clearing in
    /// reverse never trips a foreign key.
    pub const ALL: [Relation; 8] = [
        Relation::Movies,
        Relation::MovieGenres,
        Relation::MovieProductionCompanies,
        Relation::MovieCollections,
        Relation::Credits,
        Relation::Keywords,
        Relation::Ratings,
        Relation::Links,
    ];

    pub fn def(self) -> &'static TableDef {
        match self {
            Self::Movies => &MOVIES,
            Self::MovieGenres => &MOVIE_GENRES,
            Self::MovieProductionCompanies => &MOVIE_PRODUCTION_COMPANIES,
            Self::MovieCollections => &MOVIE_COLLECTIONS,
            Self::Credits => &CREDITS,
            Self::Keywords => &KEYWORDS,
            Self::Ratings => &RATINGS,
            Self::Links => &LINKS,
        }
    }

    pub fn table_name(self) -> &'static str {
        self.def().name
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<Option<i64>> for FieldValue {
    fn from(value: Option<i64>) -> Self {
        value.map_or(FieldValue::Null, FieldValue::Integer)
    }
}

impl From<Option<f64>> for FieldValue {
    fn from(value: Option<f64>) -> Self {
        value.map_or(FieldValue::Null, FieldValue::Real)
    }
}

impl From<Option<String>> for FieldValue {
    fn from(value: Option<String>) -> Self {
        value.map_or(FieldValue::Null, FieldValue::Text)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Integer(i64::from(value))
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Integer(i64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey {
    pub relation: Relation,
    pub parts: Vec<KeyPart>,
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.relation)?;
        for (index, (column, part)) in self
            .relation
            .def()
            .primary_key
            .iter()
            .zip(&self.parts)
            .enumerate()
        {
            if index > 0 {
                f.write_str(", ")?;
            }
            match part {
                KeyPart::Integer(value) => write!(f, "{column}={value}")?,
                KeyPart::Text(value) => write!(f, "{column}={value}")?,
            }
        }
        f.write_str(")")
    }
}

/// One row shaped for a target relation; values follow the column order of
/// the relation's table definition.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedRow {
    pub relation: Relation,
    pub values: Vec<FieldValue>,
}

impl TypedRow {
    pub fn new(relation: Relation, values: Vec<FieldValue>) -> Self {
        debug_assert_eq!(values.len(), relation.def().columns.len());
        Self { relation, values }
    }

    pub fn key(&self) -> RowKey {
        let def = self.relation.def();
        let parts = def
            .primary_key
            .iter()
            .filter_map(|column| def.column_index(column))
            .map(|index| match &self.values[index] {
                FieldValue::Integer(value) => KeyPart::Integer(*value),
                FieldValue::Text(value) => KeyPart::Text(value.clone()),
                FieldValue::Real(value) => KeyPart::Text(value.to_string()),
                FieldValue::Null => KeyPart::Text(String::new()),
            })
            .collect();
        RowKey {
            relation: self.relation,
            parts,
        }
    }
}

/// Maps a decoded record onto relation rows, parent first.
pub fn map_staged(staged: &Staged) -> Vec<TypedRow> {
    let mut rows = Vec::with_capacity(staged.children.len() + 1);
    if let Some(parent) = map_parent(&staged.parent) {
        rows.push(parent);
    }
    rows.extend(staged.children.iter().map(map_child));
    rows
}

fn map_parent(parent: &StagingParent) -> Option<TypedRow> {
    let row = match parent {
        StagingParent::Movie(movie) => TypedRow::new(
            Relation::Movies,
            vec![
                movie.id.into(),
                movie.title.clone().into(),
                movie.original_title.clone().into(),
                movie.original_language.clone().into(),
                movie.overview.clone().into(),
                movie.tagline.clone().into(),
                movie.status.clone().into(),
                movie.homepage.clone().into(),
                movie.imdb_id.clone().into(),
                movie.poster_path.clone().into(),
                movie.adult.into(),
                movie.video.into(),
                movie.budget.into(),
                movie.revenue.into(),
                movie.runtime.into(),
                movie.popularity.into(),
                movie.vote_average.into(),
                movie.vote_count.into(),
                movie
                    .release_date
                    .map(|date| date.format("%Y-%m-%d").to_string())
                    .into(),
                movie.production_countries.clone().into(),
                movie.spoken_languages.clone().into(),
            ],
        ),
        StagingParent::Rating(rating) => TypedRow::new(
            Relation::Ratings,
            vec![
                rating.user_id.into(),
                rating.movie_id.into(),
                FieldValue::Real(rating.rating),
                rating.rated_at.into(),
            ],
        ),
        StagingParent::Link(link) => TypedRow::new(
            Relation::Links,
            vec![
                link.movie_id.into(),
                link.imdb_id.clone().into(),
                link.tmdb_id.into(),
            ],
        ),
        StagingParent::CreditSet { .. } | StagingParent::KeywordSet { .. } => return None,
    };
    Some(row)
}

fn map_child(child: &ChildRecord) -> TypedRow {
    let movie_id = FieldValue::Integer(child.movie_id);
    match &child.entity {
        NestedEntity::Genre { id, name } => TypedRow::new(
            Relation::MovieGenres,
            vec![movie_id, (*id).into(), name.clone().into()],
        ),
        NestedEntity::Company { id, name } => TypedRow::new(
            Relation::MovieProductionCompanies,
            vec![movie_id, (*id).into(), name.clone().into()],
        ),
        NestedEntity::Collection { id, name } => TypedRow::new(
            Relation::MovieCollections,
            vec![movie_id, (*id).into(), name.clone().into()],
        ),
        NestedEntity::Keyword { id, name } => TypedRow::new(
            Relation::Keywords,
            vec![movie_id, (*id).into(), name.clone().into()],
        ),
        NestedEntity::CastMember {
            person_id,
            name,
            character,
            order,
            credit_id,
        } => TypedRow::new(
            Relation::Credits,
            vec![
                movie_id,
                "cast".to_string().into(),
                ordinal_value(child.ordinal),
                (*person_id).into(),
                name.clone().into(),
                character.clone().into(),
                FieldValue::Null,
                FieldValue::Null,
                (*order).into(),
                credit_id.clone().into(),
            ],
        ),
        NestedEntity::CrewMember {
            person_id,
            name,
            department,
            job,
            credit_id,
        } => TypedRow::new(
            Relation::Credits,
            vec![
                movie_id,
                "crew".to_string().into(),
                ordinal_value(child.ordinal),
                (*person_id).into(),
                name.clone().into(),
                FieldValue::Null,
                department.clone().into(),
                job.clone().into(),
                FieldValue::Null,
                credit_id.clone().into(),
            ],
        ),
    }
}

fn ordinal_value(ordinal: usize) -> FieldValue {
    FieldValue::Integer(i64::try_from(ordinal).unwrap_or(i64::MAX))
}

const MAX_KEY_PARTS: usize = 3;

/// Fixed-width stand-in for a primary key. Integer parts are kept as is and
/// the rare text part (credit role) is folded into a stable hash.
type CompactKey = [i64; MAX_KEY_PARTS];

fn compact_key(row: &TypedRow) -> CompactKey {
    let def = row.relation.def();
    let mut key = [0; MAX_KEY_PARTS];
    for (slot, column) in key.iter_mut().zip(def.primary_key) {
        let Some(index) = def.column_index(column) else {
            continue;
        };
        *slot = match &row.values[index] {
            FieldValue::Integer(value) => *value,
            FieldValue::Real(value) => value.to_bits() as i64,
            FieldValue::Text(value) => text_key(value),
            FieldValue::Null => i64::MIN,
        };
    }
    key
}

fn text_key(value: &str) -> i64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish() as i64
}

/// Remembers every primary key admitted during one dataset load, plus the
/// movies whose credit or keyword set was already seen.
#[derive(Debug, Default)]
pub struct DuplicateFilter {
    seen: HashMap<Relation, HashSet<CompactKey>>,
    sets: HashSet<(Relation, i64)>,
}

impl DuplicateFilter {
    /// Returns the rows that may proceed and the number skipped as
    /// duplicates. A repeated source record (same parent key, or same movie
    /// for a credit/keyword set) drops its whole group.
    pub fn admit(&mut self, parent: &StagingParent, rows: Vec<TypedRow>) -> (Vec<TypedRow>, usize) {
        let repeated = match parent {
            StagingParent::CreditSet { movie_id } => !self.sets.insert((Relation::Credits, *movie_id)),
            StagingParent::KeywordSet { movie_id } => {
                !self.sets.insert((Relation::Keywords, *movie_id))
            }
            _ => rows
                .first()
                .filter(|first| is_parent(first.relation))
                .is_some_and(|first| self.contains(first)),
        };
        if repeated {
            let skipped = rows.len();
            return (Vec::new(), skipped);
        }

        let mut admitted = Vec::with_capacity(rows.len());
        let mut skipped = 0;
        for row in rows {
            let key = compact_key(&row);
            if self.seen.entry(row.relation).or_default().insert(key) {
                admitted.push(row);
            } else {
                skipped += 1;
            }
        }
        (admitted, skipped)
    }

    fn contains(&self, row: &TypedRow) -> bool {
        self.seen
            .get(&row.relation)
            .is_some_and(|keys| keys.contains(&compact_key(row)))
    }
}

fn is_parent(relation: Relation) -> bool {
    matches!(
        relation,
        Relation::Movies | Relation::Ratings | Relation::Links
    )
}
