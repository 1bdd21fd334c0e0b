use colldex::indexer::csharp::CSharpExtractor;
use colldex::model::{CollectionHint, OperationKind};

fn extract(source: &str) -> colldex::indexer::extract::ExtractedFile {
    let mut extractor = CSharpExtractor::new().unwrap();
    extractor.extract(source, "src/Repositories.cs").unwrap()
}

#[test]
fn find_with_lambda_filter_and_fluent_modifiers() {
    let source = r#"
namespace Shop.Data;

public class OrderRepository {
    private readonly IMongoCollection<Order> _orders;

    public OrderRepository(IMongoDatabase db) {
        _orders = db.GetCollection<Order>("orders");
    }

    public List<Order> Recent(string userId) {
        return _orders.Find(o => o.UserId == userId && o.Total > 10)
            .SortByDescending(o => o.CreatedAt)
            .Limit(20)
            .ToList();
    }
}
"#;
    let output = extract(source);
    assert_eq!(output.operations.len(), 1);
    let op = &output.operations[0];
    assert_eq!(op.kind, OperationKind::Find);
    assert_eq!(op.document_type.as_deref(), Some("Order"));
    assert_eq!(op.hint, Some(CollectionHint::Literal("orders".to_string())));
    assert_eq!(op.span.symbol, "Shop.Data.OrderRepository.Recent");
    assert_eq!(op.limit, Some(20));
    assert!(!op.transactional);

    let filter = op.filter.as_ref().unwrap();
    assert!(filter.mentions_field("UserId"));
    assert!(filter.mentions_field("Total"));
    let sort = op.sort.as_ref().unwrap();
    assert!(sort.mentions_field("CreatedAt"));

    assert_eq!(output.hint_sites.len(), 1);
    let site = &output.hint_sites[0];
    assert_eq!(site.document_type, "Order");
    assert_eq!(site.hint, CollectionHint::Literal("orders".to_string()));
    assert!(site.context.contains("GetCollection<Order>"));
}

#[test]
fn operations_without_filter_get_an_empty_filter() {
    let source = r#"
public class UserRepository {
    private readonly IMongoCollection<User> _users;
    public long CountAll() {
        return _users.CountDocuments(FilterDefinition<User>.Empty);
    }
    public void Add(User user) {
        _users.InsertOne(user);
    }
}
"#;
    let output = extract(source);
    let insert = output
        .operations
        .iter()
        .find(|op| op.kind == OperationKind::InsertOne)
        .unwrap();
    assert!(insert.filter.is_none());
    let count = output
        .operations
        .iter()
        .find(|op| op.kind == OperationKind::Count)
        .unwrap();
    assert!(count.filter.is_some());
}

#[test]
fn aggregate_lookup_records_join_stage() {
    let source = r#"
public class ReportRepository {
    private readonly IMongoCollection<Order> _orders;

    public async Task<List<BsonDocument>> OrdersWithUsers() {
        return await _orders.Aggregate()
            .Match(o => o.Total > 100)
            .Lookup("users", "UserId", "_id", "user")
            .As<BsonDocument>()
            .ToListAsync();
    }
}
"#;
    let output = extract(source);
    let op = output
        .operations
        .iter()
        .find(|op| op.kind == OperationKind::Aggregate)
        .unwrap();
    let stages = op.stages.as_ref().unwrap();
    let operators: Vec<&str> = stages.iter().map(|s| s.operator.as_str()).collect();
    assert_eq!(operators, vec!["$match", "$lookup"]);
    let lookup = &stages[1];
    assert!(lookup.is_join());
    assert_eq!(lookup.from_collection.as_deref(), Some("users"));
    assert_eq!(lookup.local_field.as_deref(), Some("UserId"));
    assert_eq!(lookup.foreign_field.as_deref(), Some("_id"));
    assert_eq!(lookup.output_field.as_deref(), Some("user"));
}

#[test]
fn aggregate_with_unreadable_pipeline_keeps_a_placeholder_stage() {
    let source = r#"
public class Reports {
    private readonly IMongoCollection<Order> _orders;
    public object Run(PipelineDefinition<Order, BsonDocument> pipeline) {
        return _orders.Aggregate(pipeline);
    }
}
"#;
    let output = extract(source);
    let op = &output.operations[0];
    let stages = op.stages.as_ref().unwrap();
    assert_eq!(stages.len(), 1);
    assert_eq!(stages[0].operator, "$pipeline");
}

#[test]
fn session_argument_marks_operation_transactional() {
    let source = r#"
public class Transfers {
    private readonly IMongoCollection<Account> _accounts;
    public void Move(IClientSessionHandle session, string fromId) {
        _accounts.UpdateOne(session, a => a.Id == fromId, Builders<Account>.Update.Inc(a => a.Balance, -10));
    }
}
"#;
    let output = extract(source);
    let op = &output.operations[0];
    assert_eq!(op.kind, OperationKind::UpdateOne);
    assert!(op.transactional);
    assert!(op.filter.as_ref().unwrap().mentions_field("Id"));
    assert!(op.update.as_ref().unwrap().mentions_field("Balance"));
}

#[test]
fn calls_on_unrelated_receivers_are_ignored() {
    let source = r#"
public class Cache {
    private readonly List<User> _items = new();
    public User Lookup(string id) {
        return _items.Find(u => u.Id == id);
    }
}
"#;
    let output = extract(source);
    assert!(output.operations.is_empty());
}

#[test]
fn session_like_filter_names_are_not_sessions() {
    let source = r#"
public class Audits {
    private readonly IMongoCollection<Audit> _audits;
    public List<Audit> ForSession(FilterDefinition<Audit> sessionFilter) {
        return _audits.Find(sessionFilter).ToList();
    }
}
"#;
    let output = extract(source);
    let op = &output.operations[0];
    assert_eq!(op.kind, OperationKind::Find);
    assert!(!op.transactional);
    assert_eq!(op.filter.as_ref().unwrap().text, "sessionFilter");
}
