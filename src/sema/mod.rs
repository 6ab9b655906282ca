mod irrelevant;
mod resolve;
mod tyck;

pub use irrelevant::eliminate_irrelevant;
pub use resolve::resolve;
pub use tyck::typeck;

use std::collections::HashMap;

use crate::ast;
use crate::message::Span;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct VarId(pub usize);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FunId(pub usize);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ClassId(pub usize);

/// A resolved type. `Unknown` appears only before type checking and in
/// expressions that already produced an error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Type {
    Unknown,
    Int,
    Bool,
    Str,
    Void,
    Null,
    Array(Box<Type>),
    Class(ClassId),
}

impl Type {
    /// Heap references, to which `null` can be assigned and compared.
    pub fn is_reference(&self) -> bool {
        matches!(self, Type::Array(_) | Type::Class(_) | Type::Null)
    }

    /// Can a value of type `other` be stored in a slot of type `self`?
    pub fn accepts(&self, other: &Type) -> bool {
        // Errors have already been reported; don't cascade.
        if matches!(self, Type::Unknown) || matches!(other, Type::Unknown) {
            return true;
        }

        if self == other {
            return true;
        }

        matches!(other, Type::Null) && self.is_reference()
    }

    pub fn name(&self, world: &World) -> String {
        match self {
            Type::Unknown => "?".into(),
            Type::Int => "int".into(),
            Type::Bool => "bool".into(),
            Type::Str => "string".into(),
            Type::Void => "void".into(),
            Type::Null => "null".into(),
            Type::Array(elem) => format!("{}[]", elem.name(world)),
            Type::Class(id) => world.class(*id).name.clone(),
        }
    }
}

/// Where a variable's value lives.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Storage {
    Global,
    Local,
    Param,
    /// Field of a class, with its slot index.
    Member(ClassId, usize),
}

#[derive(Debug)]
pub struct VariableEntity {
    pub name: String,
    pub ty: Type,
    pub storage: Storage,
    pub span: Span,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FunKind {
    Source,
    Method(ClassId),
    Ctor(ClassId),
    /// Library function lowered to a call of the given runtime symbol.
    Builtin(&'static str),
}

#[derive(Debug)]
pub struct FunctionEntity {
    pub name: String,
    /// The assembly label. Unique across the program.
    pub label: String,
    pub kind: FunKind,
    pub ret: Type,
    /// Includes the implicit `this` for methods and constructors.
    pub params: Vec<VarId>,
    /// Every local declared anywhere in the body.
    pub locals: Vec<VarId>,
    pub body: ast::Block,
    pub span: Span,
}

#[derive(Debug)]
pub struct ClassEntity {
    pub name: String,
    /// Field slots in declaration order.
    pub fields: Vec<VarId>,
    pub methods: Vec<FunId>,
    pub ctor: Option<FunId>,
    pub span: Span,
}

impl ClassEntity {
    /// Heap size in bytes. `new` never allocates an empty block.
    pub fn size(&self) -> i64 {
        8 * self.fields.len().max(1) as i64
    }
}

/// What a bare name refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Binding {
    /// A variable: global, local, parameter, or (through `this`) a field.
    Var(VarId),
    Fun(FunId),
    /// A method of the enclosing class, called without a receiver.
    Method(FunId),
}

/// What `object.name` refers to, decided by the type checker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemberBinding {
    Field(VarId),
    Method(FunId),
    ArraySize,
    StrLength,
    StrSubstring,
    StrParseInt,
    StrOrd,
}

/// The symbol environment: every entity of the program, in arenas keyed by
/// id. Built by `resolve`, annotated by `typeck`, consumed by the IR builder.
#[derive(Debug, Default)]
pub struct World {
    pub vars: Vec<VariableEntity>,
    pub funs: Vec<FunctionEntity>,
    pub classes: Vec<ClassEntity>,
    pub class_names: HashMap<String, ClassId>,

    /// Global variables in declaration order.
    pub globals: Vec<VarId>,
    /// Global initializers in declaration order, for the implicit entry
    /// function.
    pub global_inits: Vec<(VarId, ast::Expr)>,

    pub main: Option<FunId>,
}

impl World {
    pub fn var(&self, id: VarId) -> &VariableEntity {
        &self.vars[id.0]
    }

    pub fn fun(&self, id: FunId) -> &FunctionEntity {
        &self.funs[id.0]
    }

    pub fn class(&self, id: ClassId) -> &ClassEntity {
        &self.classes[id.0]
    }

    pub fn add_var(&mut self, var: VariableEntity) -> VarId {
        let id = VarId(self.vars.len());
        self.vars.push(var);
        id
    }

    pub fn add_fun(&mut self, fun: FunctionEntity) -> FunId {
        let id = FunId(self.funs.len());
        self.funs.push(fun);
        id
    }

    pub fn add_class(&mut self, class: ClassEntity) -> ClassId {
        let id = ClassId(self.classes.len());
        self.classes.push(class);
        id
    }

    /// Look up a field of `class` by name.
    pub fn field(&self, class: ClassId, name: &str) -> Option<(usize, VarId)> {
        self.class(class)
            .fields
            .iter()
            .enumerate()
            .find(|(_, id)| self.var(**id).name == name)
            .map(|(index, id)| (index, *id))
    }

    /// Look up a method of `class` by name.
    pub fn method(&self, class: ClassId, name: &str) -> Option<FunId> {
        self.class(class)
            .methods
            .iter()
            .copied()
            .find(|id| self.fun(*id).name == name)
    }
}
