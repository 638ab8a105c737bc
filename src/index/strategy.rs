use serde::{Deserialize, Serialize};
use tantivy::query::{BooleanQuery, EmptyQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{
    Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, INDEXED, STORED, STRING,
};
use tantivy::tokenizer::{LowerCaser, SimpleTokenizer, TextAnalyzer, TokenStream};
use tantivy::{Index, TantivyDocument, Term};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::EntityId;

pub const ID_FIELD: &str = "_id_";
pub const EXACT_FIELD: &str = "_exact_";
pub const TEXT_FIELD: &str = "_text_";
pub const ANY_FIELD: &str = "_any_";
pub const ANY_MARKER: &str = "1";

pub const FULLTEXT_TOKENIZER: &str = "txindex_fulltext";

/// How values are indexed and how lookups are turned into queries.
///
/// Chosen once per data source. Every strategy stores the untokenized value
/// in `_exact_`, which is what deletes match against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IndexStrategy {
    /// Whole-value equality.
    #[default]
    Exact,
    /// Lower-cased word matching; every word of the lookup must occur.
    Fulltext,
    /// The lookup value is a query string over the tokenized value.
    QuerySyntax,
}

/// Resolved field handles of one key index.
#[derive(Debug, Clone, Copy)]
pub struct KeyFields {
    pub id: Field,
    pub exact: Field,
    pub text: Option<Field>,
    pub any: Option<Field>,
}

impl IndexStrategy {
    pub fn is_tokenized(&self) -> bool {
        !matches!(self, IndexStrategy::Exact)
    }

    /// Schema of a key index; `with_marker` adds the wildcard marker field
    /// used by in-memory transaction indexes.
    pub fn schema(&self, with_marker: bool) -> Schema {
        let mut builder = Schema::builder();
        builder.add_i64_field(ID_FIELD, INDEXED | STORED);
        builder.add_text_field(EXACT_FIELD, STRING);
        if self.is_tokenized() {
            let indexing = TextFieldIndexing::default()
                .set_tokenizer(FULLTEXT_TOKENIZER)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions);
            builder.add_text_field(TEXT_FIELD, TextOptions::default().set_indexing_options(indexing));
        }
        if with_marker {
            builder.add_text_field(ANY_FIELD, STRING);
        }
        builder.build()
    }

    pub fn fields(&self, schema: &Schema) -> Result<KeyFields> {
        let text = if self.is_tokenized() {
            Some(schema.get_field(TEXT_FIELD)?)
        } else {
            None
        };
        Ok(KeyFields {
            id: schema.get_field(ID_FIELD)?,
            exact: schema.get_field(EXACT_FIELD)?,
            text,
            any: schema.get_field(ANY_FIELD).ok(),
        })
    }

    /// Tokenizers are not persisted with an index and must be registered on
    /// every handle, fresh or reopened.
    pub fn register_tokenizers(index: &Index) {
        let analyzer = TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(LowerCaser)
            .build();
        index.tokenizers().register(FULLTEXT_TOKENIZER, analyzer);
    }

    pub fn document(&self, fields: &KeyFields, entity: EntityId, value: &str) -> TantivyDocument {
        let mut doc = TantivyDocument::default();
        doc.add_i64(fields.id, entity.0);
        doc.add_text(fields.exact, value);
        if let Some(text) = fields.text {
            doc.add_text(text, value);
        }
        doc
    }

    /// A document that every marker-aware query hits for `entity`.
    pub fn marker_document(fields: &KeyFields, entity: EntityId) -> Result<TantivyDocument> {
        let any = fields.any.ok_or_else(|| Error::invalid_state("index has no marker field"))?;
        let mut doc = TantivyDocument::default();
        doc.add_i64(fields.id, entity.0);
        doc.add_text(any, ANY_MARKER);
        Ok(doc)
    }

    /// Turns a lookup value into a query against a key index.
    pub fn form_query(&self, index: &Index, fields: &KeyFields, value: &str) -> Result<Box<dyn Query>> {
        match self {
            IndexStrategy::Exact => Ok(term_query(Term::from_field_text(fields.exact, value))),
            IndexStrategy::Fulltext => {
                let text = text_field(fields)?;
                let mut analyzer = index.tokenizer_for_field(text)?;
                let mut stream = analyzer.token_stream(value);
                let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
                while stream.advance() {
                    let term = Term::from_field_text(text, &stream.token().text);
                    clauses.push((Occur::Must, term_query(term)));
                }
                if clauses.is_empty() {
                    Ok(Box::new(EmptyQuery))
                } else {
                    Ok(Box::new(BooleanQuery::new(clauses)))
                }
            }
            IndexStrategy::QuerySyntax => {
                let parser = QueryParser::for_index(index, vec![text_field(fields)?]);
                Ok(parser.parse_query(value)?)
            }
        }
    }

    /// `query OR marker`: also hits entities removed by an entity wildcard.
    pub fn with_marker(fields: &KeyFields, query: Box<dyn Query>) -> Box<dyn Query> {
        match fields.any {
            Some(any) => Box::new(BooleanQuery::new(vec![
                (Occur::Should, query),
                (Occur::Should, term_query(Term::from_field_text(any, ANY_MARKER))),
            ])),
            None => query,
        }
    }
}

/// Exact match on the parts that are present; `None` if neither is.
pub fn delete_query(fields: &KeyFields, entity: Option<EntityId>, value: Option<&str>) -> Option<Box<dyn Query>> {
    let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
    if let Some(entity) = entity {
        clauses.push((Occur::Must, term_query(Term::from_field_i64(fields.id, entity.0))));
    }
    if let Some(value) = value {
        clauses.push((Occur::Must, term_query(Term::from_field_text(fields.exact, value))));
    }
    if clauses.is_empty() {
        None
    } else {
        Some(Box::new(BooleanQuery::new(clauses)))
    }
}

pub fn entity_of(doc: &TantivyDocument, fields: &KeyFields) -> Option<EntityId> {
    doc.get_first(fields.id).and_then(|v| v.as_i64()).map(EntityId)
}

fn term_query(term: Term) -> Box<dyn Query> {
    Box::new(TermQuery::new(term, IndexRecordOption::Basic))
}

fn text_field(fields: &KeyFields) -> Result<Field> {
    fields
        .text
        .ok_or_else(|| Error::new(ErrorKind::Unsupported, "key index has no tokenized field"))
}
