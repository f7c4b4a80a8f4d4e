use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};

#[derive(Clone)]
pub enum TypedValue {
    Str(String),
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConstantType {
    String,
    Float,
    Integer,
}

impl TypedValue {
    pub fn kind(&self) -> ConstantType {
        match self {
            TypedValue::Str(_) => ConstantType::String,
            TypedValue::Int(_) => ConstantType::Integer,
            TypedValue::Float(_) => ConstantType::Float,
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedValue::Str(inner) => Some(inner),
            _ => None,
        }
    }
    pub fn as_int(&self) -> Option<i64> {
        match self {
            TypedValue::Int(inner) => Some(*inner),
            _ => None,
        }
    }
    pub fn as_float(&self) -> Option<f64> {
        match self {
            TypedValue::Int(inner) => Some(*inner as f64),
            TypedValue::Float(inner) => Some(*inner),
            TypedValue::Str(_) => None,
        }
    }
    fn rank(&self) -> u8 {
        match self {
            TypedValue::Str(_) => 0,
            TypedValue::Int(_) => 1,
            TypedValue::Float(_) => 2,
        }
    }
}

impl PartialEq for TypedValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TypedValue {}

impl PartialOrd for TypedValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TypedValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (TypedValue::Str(left), TypedValue::Str(right)) => left.cmp(right),
            (TypedValue::Int(left), TypedValue::Int(right)) => left.cmp(right),
            (TypedValue::Float(left), TypedValue::Float(right)) => left.total_cmp(right),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for TypedValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            TypedValue::Str(inner) => inner.hash(state),
            TypedValue::Int(inner) => inner.hash(state),
            TypedValue::Float(inner) => inner.to_bits().hash(state),
        }
    }
}

impl Display for TypedValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TypedValue::Str(x) => write!(f, "{:?}", x),
            TypedValue::Int(x) => write!(f, "{}", x),
            TypedValue::Float(x) => write!(f, "{:?}", x),
        }
    }
}

impl Debug for TypedValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl From<String> for TypedValue {
    fn from(value: String) -> Self {
        TypedValue::Str(value)
    }
}

impl From<&str> for TypedValue {
    fn from(value: &str) -> Self {
        TypedValue::Str(value.to_string())
    }
}

impl From<i64> for TypedValue {
    fn from(value: i64) -> Self {
        TypedValue::Int(value)
    }
}

impl From<i32> for TypedValue {
    fn from(value: i32) -> Self {
        TypedValue::Int(value as i64)
    }
}

impl From<u32> for TypedValue {
    fn from(value: u32) -> Self {
        TypedValue::Int(value as i64)
    }
}

impl From<usize> for TypedValue {
    fn from(value: usize) -> Self {
        TypedValue::Int(value as i64)
    }
}

impl From<f64> for TypedValue {
    fn from(value: f64) -> Self {
        TypedValue::Float(value)
    }
}

pub type Variable = String;

#[derive(Ord, PartialOrd, Eq, PartialEq, Clone, Hash)]
pub enum Term {
    Variable(Variable),
    Constant(TypedValue),
}

impl Term {
    pub fn variable(name: &str) -> Self {
        Term::Variable(name.to_string())
    }
    pub fn is_variable(&self) -> bool {
        matches!(self, Term::Variable(_))
    }
    pub fn is_constant(&self) -> bool {
        matches!(self, Term::Constant(_))
    }
    pub fn as_variable(&self) -> Option<&Variable> {
        match self {
            Term::Variable(name) => Some(name),
            Term::Constant(_) => None,
        }
    }
    pub fn as_constant(&self) -> Option<&TypedValue> {
        match self {
            Term::Variable(_) => None,
            Term::Constant(value) => Some(value),
        }
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Term::Variable(x) => write!(f, "{}", x),
            Term::Constant(x) => write!(f, "{}", x),
        }
    }
}

impl Debug for Term {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl From<TypedValue> for Term {
    fn from(value: TypedValue) -> Self {
        Term::Constant(value)
    }
}

macro_rules! constant_term_from {
    ($($source:ty),*) => {
        $(
            impl From<$source> for Term {
                fn from(value: $source) -> Self {
                    Term::Constant(TypedValue::from(value))
                }
            }
        )*
    };
}

constant_term_from!(String, &str, i64, i32, u32, usize, f64);

pub type Bindings = BTreeMap<Variable, Term>;

const INSERT_SUFFIX: char = '+';
const DELETE_SUFFIX: char = '-';

/// Identifies a relation, optionally qualified by the policy (service) that owns it and by a
/// modal operator such as `execute`.
#[derive(Ord, PartialOrd, Eq, PartialEq, Clone, Hash)]
pub struct Tablename {
    pub table: String,
    pub service: Option<String>,
    pub modal: Option<String>,
}

impl Tablename {
    pub fn new(table: &str) -> Self {
        debug_assert!(!table.is_empty(), "table names are never empty");
        Tablename {
            table: table.to_string(),
            service: None,
            modal: None,
        }
    }
    /// Splits `service:table` at the first colon. A name with an empty side is kept whole and
    /// fails `is_valid`.
    pub fn parse(full_name: &str) -> Self {
        match full_name.split_once(':') {
            Some((service, table)) if !service.is_empty() && !table.is_empty() => Tablename {
                table: table.to_string(),
                service: Some(service.to_string()),
                modal: None,
            },
            _ => Tablename::new(full_name),
        }
    }
    /// A non-empty table without colons, and a non-empty service if any.
    pub fn is_valid(&self) -> bool {
        !self.table.is_empty()
            && !self.table.contains(':')
            && self.service.as_deref().map_or(true, |service| !service.is_empty())
    }
    pub fn with_service(mut self, service: &str) -> Self {
        self.service = Some(service.to_string());
        self
    }
    pub fn with_modal(mut self, modal: &str) -> Self {
        self.modal = Some(modal.to_string());
        self
    }
    pub fn name(&self) -> String {
        self.name_with_default(None)
    }
    pub fn name_with_default(&self, default_service: Option<&str>) -> String {
        match self.service.as_deref().or(default_service) {
            Some(service) => format!("{}:{}", service, self.table),
            None => self.table.clone(),
        }
    }
    /// Equality after giving unqualified names the default service.
    pub fn same(&self, other: &Tablename, default_service: Option<&str>) -> bool {
        self.table == other.table
            && self.service.as_deref().or(default_service)
                == other.service.as_deref().or(default_service)
    }
    pub fn drop_service(&self) -> Self {
        Tablename {
            table: self.table.clone(),
            service: None,
            modal: self.modal.clone(),
        }
    }
    pub fn drop_modal(&self) -> Self {
        Tablename {
            table: self.table.clone(),
            service: self.service.clone(),
            modal: None,
        }
    }
    pub fn is_update(&self) -> bool {
        self.table.ends_with(INSERT_SUFFIX) || self.table.ends_with(DELETE_SUFFIX)
    }
    pub fn is_insert_update(&self) -> bool {
        self.table.ends_with(INSERT_SUFFIX)
    }
    pub fn make_update(&self, insert: bool) -> Self {
        let mut update = self.drop_update();
        update
            .table
            .push(if insert { INSERT_SUFFIX } else { DELETE_SUFFIX });
        update
    }
    pub fn drop_update(&self) -> Self {
        let mut plain = self.clone();
        if plain.is_update() {
            plain.table.pop();
        }
        plain
    }
    pub fn invert_update(&self) -> Self {
        if !self.is_update() {
            return self.clone();
        }
        self.make_update(!self.is_insert_update())
    }
}

impl From<&str> for Tablename {
    fn from(value: &str) -> Self {
        Tablename::parse(value)
    }
}

impl Display for Tablename {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Debug for Tablename {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

#[derive(Ord, PartialOrd, Eq, PartialEq, Clone, Hash)]
pub struct Literal {
    pub table: Tablename,
    pub arguments: Vec<Term>,
    pub named_arguments: BTreeMap<String, Term>,
    pub negated: bool,
}

impl Literal {
    pub fn new(table: impl Into<Tablename>, arguments: Vec<Term>) -> Self {
        Literal {
            table: table.into(),
            arguments,
            named_arguments: Default::default(),
            negated: false,
        }
    }
    pub fn negative(table: impl Into<Tablename>, arguments: Vec<Term>) -> Self {
        let mut literal = Literal::new(table, arguments);
        literal.negated = true;
        literal
    }
    pub fn from_fact(fact: &Fact) -> Self {
        Literal::new(
            Tablename::parse(&fact.table),
            fact.values.iter().cloned().map(Term::Constant).collect(),
        )
    }
    pub fn with_named(mut self, column: &str, term: Term) -> Self {
        self.named_arguments.insert(column.to_string(), term);
        self
    }
    pub fn arity(&self) -> usize {
        self.arguments.len()
    }
    pub fn is_negated(&self) -> bool {
        self.negated
    }
    pub fn is_atom(&self) -> bool {
        !self.negated
    }
    pub fn complement(&self) -> Self {
        let mut complement = self.clone();
        complement.negated = !self.negated;
        complement
    }
    pub fn make_positive(&self) -> Self {
        let mut positive = self.clone();
        positive.negated = false;
        positive
    }
    pub fn tablename(&self) -> String {
        self.table.name()
    }
    pub fn is_update(&self) -> bool {
        self.table.is_update()
    }
    pub fn drop_service(&self) -> Self {
        let mut local = self.clone();
        local.table = self.table.drop_service();
        local
    }
    pub fn variables(&self) -> BTreeSet<Variable> {
        self.arguments
            .iter()
            .chain(self.named_arguments.values())
            .filter_map(|term| term.as_variable().cloned())
            .collect()
    }
    pub fn is_ground(&self) -> bool {
        self.arguments
            .iter()
            .chain(self.named_arguments.values())
            .all(Term::is_constant)
    }
    /// Values of a ground literal, `None` otherwise.
    pub fn argument_values(&self) -> Option<Vec<TypedValue>> {
        self.arguments
            .iter()
            .map(|term| term.as_constant().cloned())
            .collect()
    }
    pub fn to_fact(&self) -> Option<Fact> {
        if self.negated || !self.named_arguments.is_empty() {
            return None;
        }

        Some(Fact {
            table: self.table.name(),
            values: self.argument_values()?,
        })
    }
    pub fn plug(&self, bindings: &Bindings) -> Self {
        let substitute = |term: &Term| match term {
            Term::Variable(name) => bindings.get(name).cloned().unwrap_or_else(|| term.clone()),
            Term::Constant(_) => term.clone(),
        };

        Literal {
            table: self.table.clone(),
            arguments: self.arguments.iter().map(substitute).collect(),
            named_arguments: self
                .named_arguments
                .iter()
                .map(|(column, term)| (column.clone(), substitute(term)))
                .collect(),
            negated: self.negated,
        }
    }
}

impl Display for Literal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.negated {
            write!(f, "not ")?;
        }
        if let Some(modal) = &self.table.modal {
            write!(f, "{}[", modal)?;
        }
        write!(f, "{}(", self.table.name())?;
        let positional = self.arguments.iter().map(|term| term.to_string());
        let named = self
            .named_arguments
            .iter()
            .map(|(column, term)| format!("{}={}", column, term));
        let rendered: Vec<String> = positional.chain(named).collect();
        write!(f, "{})", rendered.join(", "))?;
        if self.table.modal.is_some() {
            write!(f, "]")?;
        }

        Ok(())
    }
}

impl Debug for Literal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// Ground tuple of unwrapped values, used for bulk base data.
#[derive(Ord, PartialOrd, Eq, PartialEq, Clone, Hash)]
pub struct Fact {
    pub table: String,
    pub values: Vec<TypedValue>,
}

impl Fact {
    pub fn new(table: &str, values: Vec<TypedValue>) -> Self {
        Fact {
            table: table.to_string(),
            values,
        }
    }
}

impl Display for Fact {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Literal::from_fact(self))
    }
}

impl Debug for Fact {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// Equality, hashing and ordering only look at heads and body.
#[derive(Clone)]
pub struct Rule {
    pub heads: Vec<Literal>,
    pub body: Vec<Literal>,
    pub id: Option<String>,
    pub name: Option<String>,
}

impl Rule {
    pub fn new(head: Literal, body: Vec<Literal>) -> Self {
        Rule {
            heads: vec![head],
            body,
            id: None,
            name: None,
        }
    }
    pub fn with_heads(heads: Vec<Literal>, body: Vec<Literal>) -> Self {
        debug_assert!(!heads.is_empty(), "rules have at least one head");
        Rule {
            heads,
            body,
            id: None,
            name: None,
        }
    }
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
    pub fn head(&self) -> &Literal {
        &self.heads[0]
    }
    pub fn is_regular(&self) -> bool {
        self.heads.len() == 1
    }
    pub fn variables(&self) -> BTreeSet<Variable> {
        self.heads
            .iter()
            .chain(self.body.iter())
            .flat_map(Literal::variables)
            .collect()
    }
    pub fn head_variables(&self) -> BTreeSet<Variable> {
        self.heads.iter().flat_map(Literal::variables).collect()
    }
    pub fn body_variables(&self) -> BTreeSet<Variable> {
        self.body.iter().flat_map(Literal::variables).collect()
    }
    pub fn tablenames(&self) -> BTreeSet<String> {
        self.heads
            .iter()
            .chain(self.body.iter())
            .map(Literal::tablename)
            .collect()
    }
    pub fn plug(&self, bindings: &Bindings) -> Self {
        Rule {
            heads: self.heads.iter().map(|head| head.plug(bindings)).collect(),
            body: self.body.iter().map(|literal| literal.plug(bindings)).collect(),
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.heads == other.heads && self.body == other.body
    }
}

impl Eq for Rule {}

impl Hash for Rule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.heads.hash(state);
        self.body.hash(state);
    }
}

impl PartialOrd for Rule {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rule {
    fn cmp(&self, other: &Self) -> Ordering {
        self.heads
            .cmp(&other.heads)
            .then_with(|| self.body.cmp(&other.body))
    }
}

impl Display for Rule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let heads: Vec<String> = self.heads.iter().map(|head| head.to_string()).collect();
        write!(f, "{}", heads.join(", "))?;
        if !self.body.is_empty() {
            let body: Vec<String> = self.body.iter().map(|literal| literal.to_string()).collect();
            write!(f, " :- {}", body.join(", "))?;
        }

        Ok(())
    }
}

impl Debug for Rule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// Anything a theory can store.
#[derive(Ord, PartialOrd, Eq, PartialEq, Clone, Hash)]
pub enum Formula {
    Fact(Fact),
    Literal(Literal),
    Rule(Rule),
}

impl Formula {
    pub fn is_atom(&self) -> bool {
        !matches!(self, Formula::Rule(_))
    }
    /// Facts are widened to literals.
    pub fn as_literal(&self) -> Option<Literal> {
        match self {
            Formula::Fact(fact) => Some(Literal::from_fact(fact)),
            Formula::Literal(literal) => Some(literal.clone()),
            Formula::Rule(_) => None,
        }
    }
    pub fn as_rule(&self) -> Option<&Rule> {
        match self {
            Formula::Rule(rule) => Some(rule),
            _ => None,
        }
    }
    pub fn variables(&self) -> BTreeSet<Variable> {
        match self {
            Formula::Fact(_) => Default::default(),
            Formula::Literal(literal) => literal.variables(),
            Formula::Rule(rule) => rule.variables(),
        }
    }
    pub fn tablenames(&self) -> BTreeSet<String> {
        match self {
            Formula::Fact(fact) => BTreeSet::from([fact.table.clone()]),
            Formula::Literal(literal) => BTreeSet::from([literal.tablename()]),
            Formula::Rule(rule) => rule.tablenames(),
        }
    }
}

impl From<Fact> for Formula {
    fn from(value: Fact) -> Self {
        Formula::Fact(value)
    }
}

impl From<Literal> for Formula {
    fn from(value: Literal) -> Self {
        Formula::Literal(value)
    }
}

impl From<Rule> for Formula {
    fn from(value: Rule) -> Self {
        Formula::Rule(value)
    }
}

impl Display for Formula {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Formula::Fact(x) => write!(f, "{}", x),
            Formula::Literal(x) => write!(f, "{}", x),
            Formula::Rule(x) => write!(f, "{}", x),
        }
    }
}

impl Debug for Formula {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

pub type Program = Vec<Rule>;

#[cfg(test)]
mod tests {
    use crate::*;

    fn var(name: &str) -> Term {
        Term::variable(name)
    }

    #[test]
    fn test_tablename_parse_and_update_suffixes() {
        let qualified = Tablename::parse("nova:servers");
        assert_eq!(Some("nova".to_string()), qualified.service);
        assert_eq!("servers", qualified.table);
        assert_eq!("nova:servers", qualified.name());

        let plain = Tablename::parse("servers");
        assert!(plain.same(&qualified, Some("nova")));
        assert!(!plain.same(&qualified, Some("neutron")));

        let insert = plain.make_update(true);
        assert_eq!("servers+", insert.table);
        assert!(insert.is_update());
        assert_eq!("servers-", insert.invert_update().table);
        assert_eq!(plain, insert.drop_update());

        for malformed in ["nova:", ":servers"] {
            let parsed = Tablename::parse(malformed);
            assert_eq!(malformed, parsed.table);
            assert_eq!(None, parsed.service);
            assert!(!parsed.is_valid());
        }
        assert!(qualified.is_valid());
    }

    #[test]
    fn test_literal_variables_and_plug() {
        let literal = Literal::new("p", vec![var("x"), Term::from(1), var("y")])
            .with_named("name", var("z"));
        let expected: BTreeSet<Variable> = ["x", "y", "z"].iter().map(|x| x.to_string()).collect();
        assert_eq!(expected, literal.variables());
        assert!(!literal.is_ground());

        let bindings: Bindings = vec![
            ("x".to_string(), Term::from("a")),
            ("y".to_string(), Term::from(2)),
            ("z".to_string(), Term::from(3.5)),
        ]
        .into_iter()
        .collect();
        let plugged = literal.plug(&bindings);
        assert!(plugged.is_ground());
        assert_eq!(r#"p("a", 1, 2, name=3.5)"#, plugged.to_string());
    }

    #[test]
    fn test_rule_identity_ignores_id_and_name() {
        let head = Literal::new("p", vec![var("x")]);
        let body = vec![Literal::new("q", vec![var("x")]), Literal::negative("r", vec![var("x")])];
        let left = Rule::new(head.clone(), body.clone()).with_id("1");
        let right = Rule::new(head, body).with_name("named");
        assert_eq!(left, right);
        assert_eq!("p(x) :- q(x), not r(x)", left.to_string());
    }

    #[test]
    fn test_total_order() {
        assert!(var("z") < Term::from("a"));
        assert!(TypedValue::from("z") < TypedValue::from(0));
        assert!(TypedValue::from(1) < TypedValue::from(0.5));
        assert_eq!(TypedValue::Float(f64::NAN), TypedValue::Float(f64::NAN));

        let fact: Formula = Fact::new("p", vec![1.into()]).into();
        let literal: Formula = Literal::new("p", vec![var("x")]).into();
        let rule: Formula = Rule::new(Literal::new("p", vec![]), vec![]).into();
        assert!(fact < literal && literal < rule);
    }
}
